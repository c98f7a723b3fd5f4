use serde_json::{json, Value};

use super::network::Vpc;
use super::Construct;
use crate::error::StackError;
use crate::settings::ServiceSettings;
use crate::template::iam::{PolicyStatement, Principal, Role};
use crate::template::intrinsic::{join, reference, AWS_REGION};
use crate::template::{LogicalId, Output, RemovalPolicy, Resource, Template};

pub const ECS_TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

/// ECS cluster the service's tasks are placed in
#[derive(Debug)]
pub struct Cluster {
    id: LogicalId,
}

impl Cluster {
    pub fn new(id: LogicalId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &LogicalId {
        &self.id
    }
}

impl Construct for Cluster {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        template.add_resource(self.id.clone(), Resource::new("AWS::ECS::Cluster"))
    }
}

/// Fargate service behind an internet-facing application load balancer.
///
/// Tasks run in the private subnets only; the load balancer sits in the
/// public ones and is the single inbound path. Rollouts are owned by an
/// external CodeDeploy controller.
// TODO: blue/green cutover still needs the CodeDeploy application,
// deployment group and a Deploy stage wired to the secondary target group.
#[derive(Debug)]
pub struct LoadBalancedFargateService {
    id: LogicalId,
    family: String,
    cluster: LogicalId,
    settings: ServiceSettings,
    vpc_ref: Value,
    public_subnets: Vec<LogicalId>,
    public_routes: Vec<LogicalId>,
    private_subnets: Vec<LogicalId>,
    task_role: Role,
    execution_role: Role,
}

impl LoadBalancedFargateService {
    pub fn new(
        id: LogicalId,
        stack_name: &str,
        cluster: &Cluster,
        vpc: &Vpc,
        settings: &ServiceSettings,
    ) -> Self {
        let task_def = id.child("TaskDef");
        let mut execution_role = Role::new(
            task_def.child("ExecutionRole"),
            Principal::service(ECS_TASKS_PRINCIPAL),
        );
        let log_group = Self::log_group_id_for(&task_def, &settings.container_name);
        execution_role.add_to_policy(
            PolicyStatement::allow()
                .actions(["logs:CreateLogStream", "logs:PutLogEvents"])
                .resource(log_group.arn()),
        );

        Self {
            family: format!("{}{}", stack_name.replace('-', ""), task_def),
            task_role: Role::new(task_def.child("TaskRole"), Principal::service(ECS_TASKS_PRINCIPAL)),
            execution_role,
            id,
            cluster: cluster.id().clone(),
            settings: settings.clone(),
            vpc_ref: vpc.vpc_ref(),
            public_subnets: vpc.public_subnets().map(|s| s.id.clone()).collect(),
            public_routes: vpc.public_subnets().map(|s| s.default_route_id()).collect(),
            private_subnets: vpc.private_subnets().map(|s| s.id.clone()).collect(),
        }
    }

    fn log_group_id_for(task_def: &LogicalId, container_name: &str) -> LogicalId {
        task_def.child(&format!("{}LogGroup", container_name))
    }

    pub fn service_id(&self) -> LogicalId {
        self.id.child("Service")
    }

    pub fn task_definition_id(&self) -> LogicalId {
        self.id.child("TaskDef")
    }

    pub fn load_balancer_id(&self) -> LogicalId {
        self.id.child("LB")
    }

    fn lb_security_group_id(&self) -> LogicalId {
        self.load_balancer_id().child("SecurityGroup")
    }

    fn service_security_group_id(&self) -> LogicalId {
        self.id.child("SecurityGroup")
    }

    pub fn listener_id(&self) -> LogicalId {
        self.load_balancer_id().child("PublicListener")
    }

    pub fn target_group_id(&self) -> LogicalId {
        self.listener_id().child("ECSGroup")
    }

    fn log_group_id(&self) -> LogicalId {
        Self::log_group_id_for(&self.task_definition_id(), &self.settings.container_name)
    }

    fn refs(ids: &[LogicalId]) -> Value {
        Value::Array(ids.iter().map(LogicalId::reference).collect())
    }

    fn render_load_balancer(&self, template: &mut Template) -> Result<(), StackError> {
        let port = self.settings.container_port;
        let lb = self.load_balancer_id();
        let lb_sg = self.lb_security_group_id();
        let service_sg = self.service_security_group_id();

        let mut lb_resource = Resource::new("AWS::ElasticLoadBalancingV2::LoadBalancer")
            .property(
                "LoadBalancerAttributes",
                json!([{ "Key": "deletion_protection.enabled", "Value": "false" }]),
            )
            .property("Scheme", json!("internet-facing"))
            .property("SecurityGroups", json!([lb_sg.attr("GroupId")]))
            .property("Subnets", Self::refs(&self.public_subnets))
            .property("Type", json!("application"));
        // The load balancer is only reachable once the public routes exist
        for route in &self.public_routes {
            lb_resource = lb_resource.depends_on(route);
        }
        template.add_resource(lb.clone(), lb_resource)?;

        template.add_resource(
            lb_sg.clone(),
            Resource::new("AWS::EC2::SecurityGroup")
                .property(
                    "GroupDescription",
                    json!(format!("Automatically created Security Group for ELB {}", lb)),
                )
                .property(
                    "SecurityGroupIngress",
                    json!([{
                        "CidrIp": "0.0.0.0/0",
                        "Description": "Allow from anyone on port 80",
                        "FromPort": 80,
                        "IpProtocol": "tcp",
                        "ToPort": 80
                    }]),
                )
                .property("VpcId", self.vpc_ref.clone()),
        )?;

        template.add_resource(
            lb_sg.child("toServiceSecurityGroupEgress"),
            Resource::new("AWS::EC2::SecurityGroupEgress")
                .property("Description", json!("Load balancer to target"))
                .property("DestinationSecurityGroupId", service_sg.attr("GroupId"))
                .property("FromPort", json!(port))
                .property("GroupId", lb_sg.attr("GroupId"))
                .property("IpProtocol", json!("tcp"))
                .property("ToPort", json!(port)),
        )?;

        template.add_resource(
            self.listener_id(),
            Resource::new("AWS::ElasticLoadBalancingV2::Listener")
                .property(
                    "DefaultActions",
                    json!([{
                        "TargetGroupArn": self.target_group_id().reference(),
                        "Type": "forward"
                    }]),
                )
                .property("LoadBalancerArn", lb.reference())
                .property("Port", json!(80))
                .property("Protocol", json!("HTTP")),
        )?;

        template.add_resource(
            self.target_group_id(),
            http_target_group(self.vpc_ref.clone(), port),
        )?;

        Ok(())
    }

    fn render_task_definition(&self, template: &mut Template) -> Result<(), StackError> {
        let task_def = self.task_definition_id();
        let log_group = self.log_group_id();

        self.task_role.render(template)?;
        self.execution_role.render(template)?;

        // Service log groups keep the provider default and outlive the stack
        template.add_resource(
            log_group.clone(),
            Resource::new("AWS::Logs::LogGroup").removal_policy(RemovalPolicy::Retain),
        )?;

        template.add_resource(
            task_def,
            Resource::new("AWS::ECS::TaskDefinition")
                .property(
                    "ContainerDefinitions",
                    json!([{
                        "Essential": true,
                        "Image": self.settings.image,
                        "LogConfiguration": {
                            "LogDriver": "awslogs",
                            "Options": {
                                "awslogs-group": log_group.reference(),
                                "awslogs-stream-prefix": self.id.as_str(),
                                "awslogs-region": reference(AWS_REGION)
                            }
                        },
                        "Name": self.settings.container_name,
                        "PortMappings": [{
                            "ContainerPort": self.settings.container_port,
                            "Protocol": "tcp"
                        }]
                    }]),
                )
                .property("Cpu", json!(self.settings.cpu.to_string()))
                .property("ExecutionRoleArn", self.execution_role.arn())
                .property("Family", json!(self.family))
                .property("Memory", json!(self.settings.memory_limit_mib.to_string()))
                .property("NetworkMode", json!("awsvpc"))
                .property("RequiresCompatibilities", json!(["FARGATE"]))
                .property("TaskRoleArn", self.task_role.arn()),
        )?;

        Ok(())
    }
}

fn http_target_group(vpc_ref: Value, port: u16) -> Resource {
    Resource::new("AWS::ElasticLoadBalancingV2::TargetGroup")
        .property("Port", json!(port))
        .property("Protocol", json!("HTTP"))
        .property(
            "TargetGroupAttributes",
            json!([{ "Key": "stickiness.enabled", "Value": "false" }]),
        )
        .property("TargetType", json!("ip"))
        .property("VpcId", vpc_ref)
}

impl Construct for LoadBalancedFargateService {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        self.render_load_balancer(template)?;
        self.render_task_definition(template)?;

        let port = self.settings.container_port;
        let service_sg = self.service_security_group_id();

        template.add_resource(
            service_sg.clone(),
            Resource::new("AWS::EC2::SecurityGroup")
                .property(
                    "GroupDescription",
                    json!(format!("{}/{}", self.id, service_sg)),
                )
                .property(
                    "SecurityGroupEgress",
                    json!([{
                        "CidrIp": "0.0.0.0/0",
                        "Description": "Allow all outbound traffic by default",
                        "IpProtocol": "-1"
                    }]),
                )
                .property("VpcId", self.vpc_ref.clone()),
        )?;

        template.add_resource(
            service_sg.child("fromLBSecurityGroupIngress"),
            Resource::new("AWS::EC2::SecurityGroupIngress")
                .property("Description", json!("Load balancer to target"))
                .property("FromPort", json!(port))
                .property("GroupId", service_sg.attr("GroupId"))
                .property("IpProtocol", json!("tcp"))
                .property("SourceSecurityGroupId", self.lb_security_group_id().attr("GroupId"))
                .property("ToPort", json!(port)),
        )?;

        template.add_resource(
            self.service_id(),
            Resource::new("AWS::ECS::Service")
                .property("Cluster", self.cluster.reference())
                .property("DeploymentController", json!({ "Type": "CODE_DEPLOY" }))
                .property("DesiredCount", json!(self.settings.desired_count))
                .property("EnableECSManagedTags", json!(false))
                .property(
                    "HealthCheckGracePeriodSeconds",
                    json!(self.settings.health_check_grace_period_secs),
                )
                .property("LaunchType", json!("FARGATE"))
                .property(
                    "LoadBalancers",
                    json!([{
                        "ContainerName": self.settings.container_name,
                        "ContainerPort": port,
                        "TargetGroupArn": self.target_group_id().reference()
                    }]),
                )
                .property(
                    "NetworkConfiguration",
                    json!({
                        "AwsvpcConfiguration": {
                            "AssignPublicIp": "DISABLED",
                            "SecurityGroups": [service_sg.attr("GroupId")],
                            "Subnets": Self::refs(&self.private_subnets)
                        }
                    }),
                )
                .property("TaskDefinition", self.task_definition_id().reference())
                .depends_on(&self.listener_id())
                .depends_on(&self.target_group_id())
                .depends_on(self.task_role.id()),
        )?;

        let dns_name = self.load_balancer_id().attr("DNSName");
        template.add_output(
            &format!("{}LoadBalancerDNS", self.id),
            Output {
                value: dns_name.clone(),
                description: None,
            },
        )?;
        template.add_output(
            &format!("{}ServiceURL", self.id),
            Output {
                value: join("", vec![json!("http://"), dns_name]),
                description: None,
            },
        )?;

        Ok(())
    }
}

/// Standalone IP target group the external deployment controller shifts
/// live traffic onto during a rollout.
#[derive(Debug)]
pub struct TargetGroup {
    id: LogicalId,
    name: String,
    port: u16,
    vpc_ref: Value,
}

impl TargetGroup {
    pub fn new(id: LogicalId, vpc: &Vpc, name: &str, port: u16) -> Self {
        Self {
            id,
            name: name.to_string(),
            port,
            vpc_ref: vpc.vpc_ref(),
        }
    }
}

impl Construct for TargetGroup {
    fn render(&self, template: &mut Template) -> Result<(), StackError> {
        template.add_resource(
            self.id.clone(),
            http_target_group(self.vpc_ref.clone(), self.port)
                .property("Name", json!(self.name)),
        )
    }
}
