//! Structural checks on a rendered template.
//!
//! Each check reads only the template, so they hold for whatever settings the
//! stack was built from and catch regressions in any construct.

use std::collections::{BTreeSet, HashSet};

use serde_json::Value;

use crate::cidr::Ipv4Cidr;
use crate::stack::registry::{AUTH_TOKEN_ACTION, PUSH_ACTIONS};
use crate::stack::service::ECS_TASKS_PRINCIPAL;
use crate::template::graph::DependencyGraph;
use crate::template::intrinsic::target_of;
use crate::template::{RemovalPolicy, Resource, Template};

pub const MAX_BUILD_CONCURRENCY: u64 = 8;
pub const MAX_BUILD_TIMEOUT_MINUTES: u64 = 60;

#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult {
    pub name: &'static str,
    pub outcome: Result<(), String>,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.outcome.is_ok()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConformanceReport {
    pub results: Vec<CheckResult>,
}

impl ConformanceReport {
    pub fn passed(&self) -> bool {
        self.results.iter().all(CheckResult::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(|r| !r.passed())
    }
}

type Check = fn(&Template) -> Result<(), String>;

const CHECKS: [(&str, Check); 10] = [
    ("subnets-disjoint-and-contained", subnets_disjoint_and_contained),
    ("registry-immutable-and-encrypted", registry_immutable_and_encrypted),
    ("build-registry-grants-exact", build_registry_grants_exact),
    ("pipeline-source-then-build", pipeline_source_then_build),
    ("service-tasks-in-private-subnets", service_tasks_in_private_subnets),
    ("build-limits", build_limits),
    ("pass-role-scoped-to-ecs-tasks", pass_role_scoped),
    ("registry-and-build-logs-destroyed", destroyed_on_teardown),
    ("private-routes-avoid-internet-gateway", private_routes_avoid_igw),
    ("graph-resolves-and-is-acyclic", graph_resolves_and_is_acyclic),
];

/// Run every check against `template`
pub fn run(template: &Template) -> ConformanceReport {
    let results = CHECKS
        .iter()
        .map(|&(name, check)| {
            let outcome = check(template);
            if let Err(reason) = &outcome {
                tracing::warn!(check = %name, %reason, "Conformance check failed");
            }
            CheckResult { name, outcome }
        })
        .collect();
    ConformanceReport { results }
}

fn str_prop<'a>(resource: &'a Resource, key: &str) -> Option<&'a str> {
    resource.get(key).and_then(Value::as_str)
}

fn is_of_type(template: &Template, id: &str, resource_type: &str) -> bool {
    template
        .resource(id)
        .is_some_and(|r| r.resource_type() == resource_type)
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

fn subnets_disjoint_and_contained(template: &Template) -> Result<(), String> {
    let (vpc_id, vpc) = template
        .resources_of_type("AWS::EC2::VPC")
        .next()
        .ok_or("no VPC in template")?;
    let block: Ipv4Cidr = str_prop(vpc, "CidrBlock")
        .ok_or_else(|| format!("{} has no CidrBlock", vpc_id))?
        .parse::<Ipv4Cidr>()
        .map_err(|e| format!("{}: {}", vpc_id, e))?;

    let mut seen: Vec<(&str, Ipv4Cidr)> = Vec::new();
    for (id, subnet) in template.resources_of_type("AWS::EC2::Subnet") {
        let cidr: Ipv4Cidr = str_prop(subnet, "CidrBlock")
            .ok_or_else(|| format!("{} has no CidrBlock", id))?
            .parse::<Ipv4Cidr>()
            .map_err(|e| format!("{}: {}", id, e))?;
        if !block.contains(&cidr) {
            return Err(format!("{} ({}) lies outside {}", id, cidr, block));
        }
        if let Some((other, _)) = seen.iter().find(|(_, c)| c.overlaps(&cidr)) {
            return Err(format!("{} ({}) overlaps {}", id, cidr, other));
        }
        seen.push((id, cidr));
    }
    Ok(())
}

fn registry_immutable_and_encrypted(template: &Template) -> Result<(), String> {
    let mut found = false;
    for (id, repo) in template.resources_of_type("AWS::ECR::Repository") {
        found = true;
        if str_prop(repo, "ImageTagMutability") != Some("IMMUTABLE") {
            return Err(format!("{} allows tag overwrites", id));
        }
        let encryption = repo
            .get_path(&["EncryptionConfiguration", "EncryptionType"])
            .and_then(Value::as_str);
        if encryption != Some("AES256") {
            return Err(format!("{} is not AES256 encrypted", id));
        }
    }
    if found {
        Ok(())
    } else {
        Err("no container registry in template".to_string())
    }
}

/// Statements of every inline policy attached to `role`
fn role_statements<'a>(template: &'a Template, role: &str) -> Vec<&'a Value> {
    template
        .resources_of_type("AWS::IAM::Policy")
        .filter(|(_, policy)| {
            as_list(policy.get("Roles"))
                .into_iter()
                .any(|r| target_of(r) == Some(role))
        })
        .flat_map(|(_, policy)| as_list(policy.get_path(&["PolicyDocument", "Statement"])))
        .collect()
}

fn all_statements(template: &Template) -> impl Iterator<Item = &Value> {
    template
        .resources_of_type("AWS::IAM::Policy")
        .flat_map(|(_, policy)| as_list(policy.get_path(&["PolicyDocument", "Statement"])))
}

fn build_registry_grants_exact(template: &Template) -> Result<(), String> {
    let expected: BTreeSet<&str> = PUSH_ACTIONS
        .iter()
        .copied()
        .chain([AUTH_TOKEN_ACTION])
        .collect();

    for (id, project) in template.resources_of_type("AWS::CodeBuild::Project") {
        let role = project
            .get("ServiceRole")
            .and_then(target_of)
            .ok_or_else(|| format!("{} has no service role in this template", id))?;

        let mut granted = BTreeSet::new();
        for statement in role_statements(template, role) {
            let actions: Vec<&str> = as_list(statement.get("Action"))
                .into_iter()
                .filter_map(Value::as_str)
                .filter(|a| a.starts_with("ecr:"))
                .collect();
            if actions.is_empty() {
                continue;
            }
            let resources = as_list(statement.get("Resource"));

            for action in actions {
                if !expected.contains(action) {
                    return Err(format!("{} grants unexpected {}", role, action));
                }
                granted.insert(action);
                if action == AUTH_TOKEN_ACTION {
                    if resources.iter().any(|r| r.as_str() != Some("*")) {
                        return Err(format!("{} on {} must target *", action, role));
                    }
                } else {
                    let scoped = !resources.is_empty()
                        && resources.iter().all(|r| {
                            target_of(r).is_some_and(|t| is_of_type(template, t, "AWS::ECR::Repository"))
                        });
                    if !scoped {
                        return Err(format!("{} on {} is not scoped to a repository", action, role));
                    }
                }
            }
        }

        if granted != expected {
            let missing: Vec<&str> = expected.difference(&granted).copied().collect();
            return Err(format!("{} is missing {}", role, missing.join(", ")));
        }
    }
    Ok(())
}

fn pipeline_source_then_build(template: &Template) -> Result<(), String> {
    let mut found = false;
    for (id, pipeline) in template.resources_of_type("AWS::CodePipeline::Pipeline") {
        found = true;
        let stages = as_list(pipeline.get("Stages"));
        let names: Vec<&str> = stages
            .iter()
            .filter_map(|s| s.get("Name").and_then(Value::as_str))
            .collect();
        if names != ["Source", "Build"] {
            return Err(format!("{} stages are {:?}", id, names));
        }
        for stage in stages {
            let actions = as_list(stage.get("Actions"));
            if actions.len() != 1 {
                return Err(format!(
                    "{} stage {} has {} actions",
                    id,
                    stage["Name"],
                    actions.len()
                ));
            }
        }
    }
    if found {
        Ok(())
    } else {
        Err("no pipeline in template".to_string())
    }
}

/// Route table IDs whose default route goes through an internet gateway
fn igw_route_tables(template: &Template) -> HashSet<&str> {
    template
        .resources_of_type("AWS::EC2::Route")
        .filter(|(_, route)| {
            route
                .get("GatewayId")
                .and_then(target_of)
                .is_some_and(|gw| is_of_type(template, gw, "AWS::EC2::InternetGateway"))
        })
        .filter_map(|(_, route)| route.get("RouteTableId").and_then(target_of))
        .collect()
}

/// Subnet ID -> route table IDs associated with it
fn subnet_route_tables<'a>(template: &'a Template, subnet: &str) -> Vec<&'a str> {
    template
        .resources_of_type("AWS::EC2::SubnetRouteTableAssociation")
        .filter(|(_, assoc)| assoc.get("SubnetId").and_then(target_of) == Some(subnet))
        .filter_map(|(_, assoc)| assoc.get("RouteTableId").and_then(target_of))
        .collect()
}

/// A subnet is public when it maps public IPs or routes to an internet gateway
fn is_public_subnet(template: &Template, igw_tables: &HashSet<&str>, id: &str) -> bool {
    let maps_public_ip = template
        .resource(id)
        .and_then(|s| s.get("MapPublicIpOnLaunch"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    maps_public_ip
        || subnet_route_tables(template, id)
            .iter()
            .any(|rt| igw_tables.contains(rt))
}

fn service_tasks_in_private_subnets(template: &Template) -> Result<(), String> {
    let igw_tables = igw_route_tables(template);
    for (id, service) in template.resources_of_type("AWS::ECS::Service") {
        let vpc_config = service.get_path(&["NetworkConfiguration", "AwsvpcConfiguration"]);
        if vpc_config
            .and_then(|c| c.get("AssignPublicIp"))
            .and_then(Value::as_str)
            == Some("ENABLED")
        {
            return Err(format!("{} assigns public IPs to tasks", id));
        }
        let subnets = as_list(vpc_config.and_then(|c| c.get("Subnets")));
        if subnets.is_empty() {
            return Err(format!("{} declares no task subnets", id));
        }
        for subnet in subnets {
            let subnet_id = target_of(subnet)
                .filter(|s| is_of_type(template, s, "AWS::EC2::Subnet"))
                .ok_or_else(|| format!("{} uses a subnet outside this template", id))?;
            if is_public_subnet(template, &igw_tables, subnet_id) {
                return Err(format!("{} places tasks in public subnet {}", id, subnet_id));
            }
        }
    }
    Ok(())
}

fn build_limits(template: &Template) -> Result<(), String> {
    for (id, project) in template.resources_of_type("AWS::CodeBuild::Project") {
        let concurrency = project
            .get("ConcurrentBuildLimit")
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("{} has no concurrency limit", id))?;
        if concurrency > MAX_BUILD_CONCURRENCY {
            return Err(format!(
                "{} allows {} concurrent builds (max {})",
                id, concurrency, MAX_BUILD_CONCURRENCY
            ));
        }
        let timeout = project
            .get("TimeoutInMinutes")
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("{} has no timeout", id))?;
        if timeout > MAX_BUILD_TIMEOUT_MINUTES {
            return Err(format!(
                "{} times out after {} minutes (max {})",
                id, timeout, MAX_BUILD_TIMEOUT_MINUTES
            ));
        }
    }
    Ok(())
}

fn pass_role_scoped(template: &Template) -> Result<(), String> {
    let mut found = false;
    for statement in all_statements(template) {
        let passes_role = as_list(statement.get("Action"))
            .into_iter()
            .any(|a| a.as_str() == Some("iam:PassRole"));
        if !passes_role {
            continue;
        }
        found = true;
        let services: Vec<&str> = as_list(
            statement
                .get("Condition")
                .and_then(|c| c.get("StringEqualsIfExists"))
                .and_then(|c| c.get("iam:PassedToService")),
        )
        .into_iter()
        .filter_map(Value::as_str)
        .collect();
        if services != [ECS_TASKS_PRINCIPAL] {
            return Err(format!(
                "iam:PassRole is not restricted to {} (got {:?})",
                ECS_TASKS_PRINCIPAL, services
            ));
        }
    }
    if found {
        Ok(())
    } else {
        Err("no iam:PassRole grant in template".to_string())
    }
}

fn destroyed(resource: &Resource) -> bool {
    resource.deletion_policy() == Some(RemovalPolicy::Delete)
        && resource.update_replace_policy() == Some(RemovalPolicy::Delete)
}

fn destroyed_on_teardown(template: &Template) -> Result<(), String> {
    for (id, repo) in template.resources_of_type("AWS::ECR::Repository") {
        if !destroyed(repo) {
            return Err(format!("{} is retained on teardown", id));
        }
    }
    for (id, project) in template.resources_of_type("AWS::CodeBuild::Project") {
        let group = project
            .get_path(&["LogsConfig", "CloudWatchLogs", "GroupName"])
            .and_then(target_of)
            .ok_or_else(|| format!("{} logs to no log group of this template", id))?;
        let retained = template.resource(group).map_or(true, |r| !destroyed(r));
        if retained {
            return Err(format!("{} log group {} is retained on teardown", id, group));
        }
    }
    Ok(())
}

fn private_routes_avoid_igw(template: &Template) -> Result<(), String> {
    let igw_tables = igw_route_tables(template);
    for (id, subnet) in template.resources_of_type("AWS::EC2::Subnet") {
        let private = subnet.get("MapPublicIpOnLaunch").and_then(Value::as_bool) != Some(true);
        if !private {
            continue;
        }
        if let Some(rt) = subnet_route_tables(template, id)
            .into_iter()
            .find(|rt| igw_tables.contains(rt))
        {
            return Err(format!("private subnet {} routes through {} to the internet gateway", id, rt));
        }
    }
    Ok(())
}

fn graph_resolves_and_is_acyclic(template: &Template) -> Result<(), String> {
    DependencyGraph::from_template(template)
        .and_then(|graph| graph.creation_order())
        .map(|_| ())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crate::stack::EcsPipelineStack;
    use crate::template::iam::{PolicyDocument, PolicyStatement};
    use crate::template::LogicalId;
    use serde_json::json;

    fn default_template() -> Template {
        EcsPipelineStack::new(&Settings::default())
            .unwrap()
            .synth()
            .unwrap()
    }

    fn single(resources: Vec<(&str, Resource)>) -> Template {
        let mut template = Template::new(None);
        for (id, resource) in resources {
            template.add_resource(LogicalId::new(id), resource).unwrap();
        }
        template
    }

    #[test]
    fn test_default_stack_conforms() {
        let report = run(&default_template());
        let failures: Vec<_> = report.failures().collect();
        assert!(failures.is_empty(), "failed checks: {:?}", failures);
        assert_eq!(report.results.len(), CHECKS.len());
    }

    #[test]
    fn test_overlapping_subnets_flagged() {
        let template = single(vec![
            ("VPC", Resource::new("AWS::EC2::VPC").property("CidrBlock", json!("10.0.0.0/16"))),
            ("A", Resource::new("AWS::EC2::Subnet").property("CidrBlock", json!("10.0.0.0/24"))),
            ("B", Resource::new("AWS::EC2::Subnet").property("CidrBlock", json!("10.0.0.128/25"))),
        ]);
        assert!(subnets_disjoint_and_contained(&template).is_err());
    }

    #[test]
    fn test_subnet_outside_block_flagged() {
        let template = single(vec![
            ("VPC", Resource::new("AWS::EC2::VPC").property("CidrBlock", json!("10.0.0.0/16"))),
            ("A", Resource::new("AWS::EC2::Subnet").property("CidrBlock", json!("10.1.0.0/24"))),
        ]);
        let err = subnets_disjoint_and_contained(&template).unwrap_err();
        assert!(err.contains("outside"));
    }

    #[test]
    fn test_mutable_registry_flagged() {
        let template = single(vec![(
            "Repo",
            Resource::new("AWS::ECR::Repository")
                .property("ImageTagMutability", json!("MUTABLE"))
                .property("EncryptionConfiguration", json!({ "EncryptionType": "AES256" })),
        )]);
        assert!(registry_immutable_and_encrypted(&template).is_err());
        assert!(destroyed_on_teardown(&template).is_err());
    }

    #[test]
    fn test_kms_encrypted_registry_flagged() {
        let template = single(vec![(
            "Repo",
            Resource::new("AWS::ECR::Repository")
                .property("ImageTagMutability", json!("IMMUTABLE"))
                .property("EncryptionConfiguration", json!({ "EncryptionType": "KMS" })),
        )]);
        assert_eq!(
            registry_immutable_and_encrypted(&template),
            Err("Repo is not AES256 encrypted".to_string())
        );

        let unencrypted = single(vec![(
            "Repo",
            Resource::new("AWS::ECR::Repository").property("ImageTagMutability", json!("IMMUTABLE")),
        )]);
        assert!(registry_immutable_and_encrypted(&unencrypted).is_err());
    }

    fn build_template(statements: Vec<PolicyStatement>) -> Template {
        single(vec![
            ("Repo", Resource::new("AWS::ECR::Repository")),
            ("Role", Resource::new("AWS::IAM::Role")),
            (
                "RolePolicy",
                Resource::new("AWS::IAM::Policy")
                    .property("PolicyDocument", PolicyDocument::new(statements).to_value())
                    .property("Roles", json!([{ "Ref": "Role" }])),
            ),
            (
                "Project",
                Resource::new("AWS::CodeBuild::Project")
                    .property("ServiceRole", json!({ "Fn::GetAtt": ["Role", "Arn"] })),
            ),
        ])
    }

    #[test]
    fn test_exact_registry_grants_accepted() {
        let template = build_template(vec![
            PolicyStatement::allow()
                .actions(PUSH_ACTIONS)
                .resource(json!({ "Fn::GetAtt": ["Repo", "Arn"] })),
            PolicyStatement::allow().actions([AUTH_TOKEN_ACTION]).all_resources(),
        ]);
        assert_eq!(build_registry_grants_exact(&template), Ok(()));
    }

    #[test]
    fn test_extra_registry_action_flagged() {
        let template = build_template(vec![
            PolicyStatement::allow()
                .actions(PUSH_ACTIONS)
                .actions(["ecr:BatchDeleteImage"])
                .resource(json!({ "Fn::GetAtt": ["Repo", "Arn"] })),
            PolicyStatement::allow().actions([AUTH_TOKEN_ACTION]).all_resources(),
        ]);
        let err = build_registry_grants_exact(&template).unwrap_err();
        assert!(err.contains("ecr:BatchDeleteImage"));
    }

    #[test]
    fn test_unscoped_push_flagged() {
        let template = build_template(vec![
            PolicyStatement::allow().actions(PUSH_ACTIONS).all_resources(),
            PolicyStatement::allow().actions([AUTH_TOKEN_ACTION]).all_resources(),
        ]);
        assert!(build_registry_grants_exact(&template).is_err());
    }

    #[test]
    fn test_missing_auth_token_flagged() {
        let template = build_template(vec![PolicyStatement::allow()
            .actions(PUSH_ACTIONS)
            .resource(json!({ "Fn::GetAtt": ["Repo", "Arn"] }))]);
        let err = build_registry_grants_exact(&template).unwrap_err();
        assert!(err.contains(AUTH_TOKEN_ACTION));
    }

    #[test]
    fn test_extra_stage_flagged() {
        let stage = |name: &str| json!({ "Name": name, "Actions": [{ "Name": name }] });
        let template = single(vec![(
            "Pipeline",
            Resource::new("AWS::CodePipeline::Pipeline").property(
                "Stages",
                json!([stage("Source"), stage("Build"), stage("Deploy")]),
            ),
        )]);
        assert!(pipeline_source_then_build(&template).is_err());
    }

    #[test]
    fn test_private_subnet_with_igw_route_flagged() {
        let template = single(vec![
            ("IGW", Resource::new("AWS::EC2::InternetGateway")),
            ("Subnet", Resource::new("AWS::EC2::Subnet").property("MapPublicIpOnLaunch", json!(false))),
            ("RouteTable", Resource::new("AWS::EC2::RouteTable")),
            (
                "Assoc",
                Resource::new("AWS::EC2::SubnetRouteTableAssociation")
                    .property("RouteTableId", json!({ "Ref": "RouteTable" }))
                    .property("SubnetId", json!({ "Ref": "Subnet" })),
            ),
            (
                "Route",
                Resource::new("AWS::EC2::Route")
                    .property("GatewayId", json!({ "Ref": "IGW" }))
                    .property("RouteTableId", json!({ "Ref": "RouteTable" })),
            ),
            (
                "Service",
                Resource::new("AWS::ECS::Service").property(
                    "NetworkConfiguration",
                    json!({ "AwsvpcConfiguration": { "Subnets": [{ "Ref": "Subnet" }] } }),
                ),
            ),
        ]);
        assert!(private_routes_avoid_igw(&template).is_err());
        assert!(service_tasks_in_private_subnets(&template).is_err());
    }

    #[test]
    fn test_build_limits_flagged() {
        let template = single(vec![(
            "Project",
            Resource::new("AWS::CodeBuild::Project")
                .property("ConcurrentBuildLimit", json!(16))
                .property("TimeoutInMinutes", json!(60)),
        )]);
        assert!(build_limits(&template).unwrap_err().contains("16"));
    }

    #[test]
    fn test_unconditioned_pass_role_flagged() {
        let template = build_template(vec![PolicyStatement::allow()
            .actions(["iam:PassRole"])
            .all_resources()]);
        assert!(pass_role_scoped(&template).is_err());
    }

    #[test]
    fn test_dangling_reference_flagged() {
        let template = single(vec![(
            "Subnet",
            Resource::new("AWS::EC2::Subnet").property("VpcId", json!({ "Ref": "Missing" })),
        )]);
        let report = run(&template);
        assert!(!report.passed());
        assert!(report
            .failures()
            .any(|r| r.name == "graph-resolves-and-is-acyclic"));
    }
}
