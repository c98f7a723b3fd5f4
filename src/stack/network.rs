use serde_json::{json, Value};

use super::Construct;
use crate::cidr::{CidrAllocator, Ipv4Cidr};
use crate::error::StackError;
use crate::settings::{NetworkSettings, SubnetType};
use crate::template::intrinsic::{get_azs, select};
use crate::template::{LogicalId, Resource, Template};

const ANY_IPV4: &str = "0.0.0.0/0";

/// One subnet of one tier in one availability zone
#[derive(Debug, Clone)]
pub struct Subnet {
    pub id: LogicalId,
    pub tier: String,
    pub subnet_type: SubnetType,
    pub cidr: Ipv4Cidr,
    pub az_index: usize,
    prefix: LogicalId,
}

impl Subnet {
    pub fn route_table_id(&self) -> LogicalId {
        self.prefix.child("RouteTable")
    }

    pub fn association_id(&self) -> LogicalId {
        self.prefix.child("RouteTableAssociation")
    }

    pub fn default_route_id(&self) -> LogicalId {
        self.prefix.child("DefaultRoute")
    }

    fn eip_id(&self) -> LogicalId {
        self.prefix.child("EIP")
    }

    pub fn nat_gateway_id(&self) -> LogicalId {
        self.prefix.child("NATGateway")
    }
}

/// Network boundary: one address block split into public and private tiers
/// across the configured availability zones.
#[derive(Debug)]
pub struct Vpc {
    id: LogicalId,
    path: String,
    cidr: Ipv4Cidr,
    subnets: Vec<Subnet>,
    nat_gateways: usize,
}

impl Vpc {
    pub fn new(id: LogicalId, stack_name: &str, settings: &NetworkSettings) -> Result<Self, StackError> {
        if settings.max_azs == 0 {
            return Err(StackError::invalid_setting("network.max_azs", "must be at least 1"));
        }

        let mut allocator = CidrAllocator::new(settings.cidr);
        let mut subnets = Vec::new();
        for tier in &settings.subnets {
            for az_index in 0..settings.max_azs {
                let prefix = id.child(&format!("{}Subnet{}", tier.name, az_index + 1));
                let cidr = allocator.allocate(&tier.name, tier.cidr_mask)?;
                tracing::debug!(tier = %tier.name, az_index, %cidr, "Allocated subnet");
                subnets.push(Subnet {
                    id: prefix.child("Subnet"),
                    tier: tier.name.clone(),
                    subnet_type: tier.subnet_type,
                    cidr,
                    az_index,
                    prefix,
                });
            }
        }

        let public_count = subnets
            .iter()
            .filter(|s| s.subnet_type == SubnetType::Public)
            .count();
        let has_private = subnets
            .iter()
            .any(|s| s.subnet_type == SubnetType::PrivateWithNat);
        if has_private && (settings.nat_gateways == 0 || settings.nat_gateways > public_count) {
            return Err(StackError::invalid_setting(
                "network.nat_gateways",
                format!(
                    "need between 1 and {} NAT gateways for private subnets, got {}",
                    public_count, settings.nat_gateways
                ),
            ));
        }

        Ok(Self {
            path: format!("{}/{}", stack_name, id),
            id,
            cidr: settings.cidr,
            subnets,
            nat_gateways: settings.nat_gateways,
        })
    }

    pub fn vpc_ref(&self) -> Value {
        self.id.reference()
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub fn public_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets_of(SubnetType::Public)
    }

    pub fn private_subnets(&self) -> impl Iterator<Item = &Subnet> {
        self.subnets_of(SubnetType::PrivateWithNat)
    }

    fn subnets_of(&self, subnet_type: SubnetType) -> impl Iterator<Item = &Subnet> {
        self.subnets
            .iter()
            .filter(move |s| s.subnet_type == subnet_type)
    }

    fn igw_id(&self) -> LogicalId {
        self.id.child("IGW")
    }

    fn gateway_attachment_id(&self) -> LogicalId {
        self.id.child("VPCGW")
    }

    /// Public subnets hosting a NAT gateway, in allocation order
    fn nat_subnets(&self) -> Vec<&Subnet> {
        self.public_subnets().take(self.nat_gateways).collect()
    }

    fn tags(name: &str, extra: &[(&str, &str)]) -> Value {
        let mut tags = vec![json!({ "Key": "Name", "Value": name })];
        tags.extend(
            extra
                .iter()
                .map(|(k, v)| json!({ "Key": k, "Value": v })),
        );
        Value::Array(tags)
    }

    fn render_subnet(&self, template: &mut Template, subnet: &Subnet) -> Result<(), StackError> {
        let path = format!("{}/{}Subnet{}", self.path, subnet.tier, subnet.az_index + 1);
        let type_tag = match subnet.subnet_type {
            SubnetType::Public => "Public",
            SubnetType::PrivateWithNat => "Private",
        };

        template.add_resource(
            subnet.id.clone(),
            Resource::new("AWS::EC2::Subnet")
                .property("AvailabilityZone", select(subnet.az_index, get_azs()))
                .property("CidrBlock", json!(subnet.cidr.to_string()))
                .property(
                    "MapPublicIpOnLaunch",
                    json!(subnet.subnet_type == SubnetType::Public),
                )
                .property(
                    "Tags",
                    Self::tags(
                        &path,
                        &[("subnet-name", subnet.tier.as_str()), ("subnet-type", type_tag)],
                    ),
                )
                .property("VpcId", self.vpc_ref()),
        )?;

        template.add_resource(
            subnet.route_table_id(),
            Resource::new("AWS::EC2::RouteTable")
                .property("Tags", Self::tags(&path, &[]))
                .property("VpcId", self.vpc_ref()),
        )?;

        template.add_resource(
            subnet.association_id(),
            Resource::new("AWS::EC2::SubnetRouteTableAssociation")
                .property("RouteTableId", subnet.route_table_id().reference())
                .property("SubnetId", subnet.id.reference()),
        )?;

        Ok(())
    }
}

impl Construct for Vpc {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        template.add_resource(
            self.id.clone(),
            Resource::new("AWS::EC2::VPC")
                .property("CidrBlock", json!(self.cidr.to_string()))
                .property("EnableDnsHostnames", json!(true))
                .property("EnableDnsSupport", json!(true))
                .property("InstanceTenancy", json!("default"))
                .property("Tags", Self::tags(&self.path, &[])),
        )?;

        template.add_resource(
            self.igw_id(),
            Resource::new("AWS::EC2::InternetGateway").property("Tags", Self::tags(&self.path, &[])),
        )?;
        template.add_resource(
            self.gateway_attachment_id(),
            Resource::new("AWS::EC2::VPCGatewayAttachment")
                .property("InternetGatewayId", self.igw_id().reference())
                .property("VpcId", self.vpc_ref()),
        )?;

        for subnet in &self.subnets {
            self.render_subnet(template, subnet)?;
        }

        for subnet in self.public_subnets() {
            template.add_resource(
                subnet.default_route_id(),
                Resource::new("AWS::EC2::Route")
                    .property("DestinationCidrBlock", json!(ANY_IPV4))
                    .property("GatewayId", self.igw_id().reference())
                    .property("RouteTableId", subnet.route_table_id().reference())
                    .depends_on(&self.gateway_attachment_id()),
            )?;
        }

        let nat_subnets = self.nat_subnets();
        for subnet in &nat_subnets {
            let path = format!("{}/{}Subnet{}", self.path, subnet.tier, subnet.az_index + 1);
            template.add_resource(
                subnet.eip_id(),
                Resource::new("AWS::EC2::EIP")
                    .property("Domain", json!("vpc"))
                    .property("Tags", Self::tags(&path, &[])),
            )?;
            template.add_resource(
                subnet.nat_gateway_id(),
                Resource::new("AWS::EC2::NatGateway")
                    .property("AllocationId", subnet.eip_id().attr("AllocationId"))
                    .property("SubnetId", subnet.id.reference())
                    .property("Tags", Self::tags(&path, &[]))
                    .depends_on(&subnet.default_route_id())
                    .depends_on(&subnet.association_id()),
            )?;
        }

        // Private subnets egress round-robin over the NAT gateways and never
        // get a route to the internet gateway
        for (i, subnet) in self.private_subnets().enumerate() {
            let nat = nat_subnets[i % nat_subnets.len()];
            template.add_resource(
                subnet.default_route_id(),
                Resource::new("AWS::EC2::Route")
                    .property("DestinationCidrBlock", json!(ANY_IPV4))
                    .property("NatGatewayId", nat.nat_gateway_id().reference())
                    .property("RouteTableId", subnet.route_table_id().reference()),
            )?;
        }

        Ok(())
    }
}
