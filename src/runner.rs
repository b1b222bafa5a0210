use std::collections::HashSet;
use std::thread;

use tracing::{info, warn};

use crate::boot::VirtualMediaBoot;
use crate::builder::ArtifactBuilder;
use crate::controller::MediaController;
use crate::db::NodeStore;
use crate::error::{Result, VmediaError};
use crate::images::ImageService;
use crate::models::{NodeBootContext, RamdiskParams};

/// Provisioning hook to run for a node.
#[derive(Debug, Clone)]
pub enum Phase {
    PrepareRamdisk(RamdiskParams),
    CleanUpRamdisk,
    PrepareInstance,
    CleanUpInstance,
    AttachBootIsoIfNeeded,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::PrepareRamdisk(_) => "prepare_ramdisk",
            Phase::CleanUpRamdisk => "clean_up_ramdisk",
            Phase::PrepareInstance => "prepare_instance",
            Phase::CleanUpInstance => "clean_up_instance",
            Phase::AttachBootIsoIfNeeded => "attach_boot_iso_if_needed",
        }
    }
}

pub struct NodeJob {
    pub context: NodeBootContext,
    pub controller: Box<dyn MediaController>,
    pub phase: Phase,
}

#[derive(Debug)]
pub struct PhaseOutcome {
    pub context: NodeBootContext,
    pub phase: &'static str,
    pub result: Result<()>,
}

impl<I, B, S> VirtualMediaBoot<I, B, S>
where
    I: ImageService,
    B: ArtifactBuilder,
    S: NodeStore,
{
    pub fn run_phase(
        &self,
        ctx: &mut NodeBootContext,
        controller: &dyn MediaController,
        phase: Phase,
    ) -> Result<()> {
        match phase {
            Phase::PrepareRamdisk(params) => self.prepare_ramdisk(ctx, controller, params),
            Phase::CleanUpRamdisk => self.clean_up_ramdisk(ctx, controller),
            Phase::PrepareInstance => self.prepare_instance(ctx, controller),
            Phase::CleanUpInstance => self.clean_up_instance(ctx, controller),
            Phase::AttachBootIsoIfNeeded => self.attach_boot_iso_if_needed(ctx, controller),
        }
    }
}

/// Run one phase per node, each node on its own thread.
///
/// A slow share or controller for one node never holds up the others. A
/// second job for a node already in the batch is refused rather than run
/// concurrently. Outcomes come back in job order.
pub fn run_phases<I, B, S>(boot: &VirtualMediaBoot<I, B, S>, jobs: Vec<NodeJob>) -> Vec<PhaseOutcome>
where
    I: ImageService,
    B: ArtifactBuilder,
    S: NodeStore,
{
    let mut seen = HashSet::new();
    thread::scope(|scope| {
        let pending: Vec<_> = jobs
            .into_iter()
            .map(|job| {
                if !seen.insert(job.context.node_id.clone()) {
                    warn!(node = %job.context.node_id, phase = job.phase.name(), "refusing concurrent phase");
                    let err = VmediaError::InvalidParameter(format!(
                        "node {} already has a phase in this batch",
                        job.context.node_id
                    ));
                    return Err(PhaseOutcome {
                        phase: job.phase.name(),
                        context: job.context,
                        result: Err(err),
                    });
                }
                Ok(scope.spawn(move || {
                    let NodeJob {
                        mut context,
                        controller,
                        phase,
                    } = job;
                    let name = phase.name();
                    let result = boot.run_phase(&mut context, controller.as_ref(), phase);
                    info!(node = %context.node_id, phase = name, ok = result.is_ok(), "phase finished");
                    PhaseOutcome {
                        context,
                        phase: name,
                        result,
                    }
                }))
            })
            .collect();

        pending
            .into_iter()
            .map(|entry| match entry {
                Ok(handle) => handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic)),
                Err(refused) => refused,
            })
            .collect()
    })
}
