//! The container delivery stack and the constructs it is assembled from.

pub mod build;
pub mod network;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod source;

use crate::error::StackError;
use crate::settings::Settings;
use crate::template::graph::DependencyGraph;
use crate::template::{LogicalId, Template};

use build::BuildProject;
use network::Vpc;
use pipeline::Pipeline;
use registry::Repository;
use service::{Cluster, LoadBalancedFargateService, TargetGroup};
use source::{ChangeTrigger, SourceRepository};

/// A component that contributes resources to a template
pub trait Construct {
    fn render(&self, template: &mut Template) -> Result<(), StackError>;
}

/// Network, Fargate service and the source-to-image pipeline feeding it
#[derive(Debug)]
pub struct EcsPipelineStack {
    name: String,
    description: Option<String>,
    vpc: Vpc,
    cluster: Cluster,
    service: LoadBalancedFargateService,
    target_group: TargetGroup,
    registry: Repository,
    source: SourceRepository,
    build: BuildProject,
    pipeline: Pipeline,
    trigger: ChangeTrigger,
}

impl EcsPipelineStack {
    pub fn new(settings: &Settings) -> Result<Self, StackError> {
        settings.validate()?;
        let name = settings.stack.name.as_str();

        let vpc = Vpc::new(LogicalId::new("VPC"), name, &settings.network)?;
        let cluster = Cluster::new(LogicalId::new("EcsCluster"));
        let service = LoadBalancedFargateService::new(
            LogicalId::new("Service"),
            name,
            &cluster,
            &vpc,
            &settings.service,
        );
        let target_group = TargetGroup::new(
            LogicalId::new("TargetGroup"),
            &vpc,
            &settings.service.secondary_target_group_name,
            settings.service.container_port,
        );

        let registry = Repository::new(
            LogicalId::new("ecrRepository"),
            &settings.registry.repository_name,
        );
        let source = SourceRepository::new(LogicalId::new("CodeCommit"), &settings.source);
        let mut build = BuildProject::new(LogicalId::new("CodeBuild"), &registry, &settings.build);
        let pipeline = Pipeline::new(LogicalId::new("codePipeline"), &source, &mut build);
        let trigger = source.on_branch_change(pipeline.id(), pipeline.arn());

        tracing::debug!(
            stack = %name,
            subnets = vpc.subnets().len(),
            stages = pipeline.stages().len(),
            "Assembled stack"
        );

        Ok(Self {
            name: name.to_string(),
            description: settings.stack.description.clone(),
            vpc,
            cluster,
            service,
            target_group,
            registry,
            source,
            build,
            pipeline,
            trigger,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn vpc(&self) -> &Vpc {
        &self.vpc
    }

    fn constructs(&self) -> [&dyn Construct; 9] {
        [
            &self.vpc,
            &self.cluster,
            &self.service,
            &self.target_group,
            &self.registry,
            &self.source,
            &self.build,
            &self.pipeline,
            &self.trigger,
        ]
    }

    /// Render every construct into one template and make sure every
    /// reference resolves and the resources can be created in some order.
    pub fn synth(&self) -> Result<Template, StackError> {
        let mut template = Template::new(self.description.clone());
        for construct in self.constructs() {
            construct.render(&mut template)?;
        }

        let graph = DependencyGraph::from_template(&template)?;
        graph.creation_order()?;

        tracing::info!(
            stack = %self.name,
            resources = template.len(),
            dependencies = graph.edge_count(),
            "Synthesized template"
        );
        Ok(template)
    }
}
