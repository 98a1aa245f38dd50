//! Validation sweep over the subnet configuration space.

use serde::Serialize;
use tracing::info;

use crate::error::MlError;
use crate::metrics::list_mean;
use crate::network::{Supernet, TrainingHarness};
use crate::space::SweepDims;
use crate::training::RunManager;

/// Unweighted means over every validated subnet.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepSummary {
    pub loss: f64,
    pub epe: f64,
    pub d1: f64,
    /// `"{name} ({epe:.3}), "` per subnet, in sweep order.
    pub log: String,
}

/// Validate every subnet of the cross product of `dims` (unset dimensions
/// fall back to the stage's training space), then `dims.additional`.
///
/// Each subnet is activated, its BatchNorm statistics recalibrated, and
/// its evaluation averaged across replicas before it enters the means.
pub fn validate<H: TrainingHarness>(
    rm: &mut RunManager<H>,
    epoch: usize,
    is_test: bool,
    dims: &SweepDims,
) -> Result<SweepSummary, MlError> {
    for extra in &dims.additional {
        rm.harness.network().space().validate(&extra.setting)?;
    }
    let settings = rm.space.enumerate(dims);
    let rule = "-".repeat(30);

    let mut losses = Vec::with_capacity(settings.len());
    let mut epes = Vec::with_capacity(settings.len());
    let mut d1s = Vec::with_capacity(settings.len());
    let mut log = String::new();

    for named in &settings {
        rm.write_log(&format!("{rule} Validate {} {rule}", named.name), "train", false);
        rm.harness.network_mut().set_active_subnet(&named.setting)?;
        let module_str = rm.harness.network().module_str();
        rm.write_log(&module_str, "train", false);

        rm.reset_running_statistics()?;
        let outcome = rm.harness.evaluate(epoch, is_test, &named.name)?;
        let m = outcome.metrics;
        let mut reduced = [outcome.loss, m.epe, m.d1, m.thres1, m.thres2, m.thres3];
        rm.collective().all_reduce_mean(&mut reduced)?;

        losses.push(reduced[0]);
        epes.push(reduced[1]);
        d1s.push(reduced[2]);
        log.push_str(&format!("{} ({:.3}), ", named.name, reduced[1]));
    }

    let summary = SweepSummary {
        loss: list_mean(&losses),
        epe: list_mean(&epes),
        d1: list_mean(&d1s),
        log,
    };
    info!(
        epoch = epoch + 1,
        is_test,
        subnets = settings.len(),
        epe = summary.epe,
        "Validation sweep finished"
    );
    Ok(summary)
}
