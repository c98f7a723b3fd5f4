use thiserror::Error;

/// Errors raised while building or rendering the stack's resource graph.
///
/// These are returned before anything is submitted to the provisioning
/// engine; runtime failures of the provisioned services are reported by
/// the provider, not here.
#[derive(Debug, Error, PartialEq)]
pub enum StackError {
    #[error("invalid CIDR block '{0}'")]
    InvalidCidr(String),

    #[error("subnet '{name}' mask /{mask} is not narrower than the network block {block}")]
    SubnetMaskTooWide {
        name: String,
        mask: u8,
        block: String,
    },

    #[error("network block {block} has no room left for subnet '{name}' (/{mask})")]
    AddressSpaceExhausted {
        name: String,
        mask: u8,
        block: String,
    },

    #[error("invalid setting '{field}': {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    #[error("duplicate logical ID '{0}'")]
    DuplicateLogicalId(String),

    #[error("resource '{from}' references unknown logical ID '{to}'")]
    UnknownReference { from: String, to: String },

    #[error("dependency cycle detected at '{0}'")]
    DependencyCycle(String),
}

impl StackError {
    pub fn invalid_setting(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            field,
            reason: reason.into(),
        }
    }
}
