//! One [`Analyzer`](crate::scheduler::Analyzer) per analysis technique.

pub mod ai;
pub mod dynamic;
pub mod module;
pub mod signature;
pub mod static_analysis;

pub use ai::AiAnalyzer;
pub use dynamic::DynamicAnalyzer;
pub use module::ModuleAnalyzer;
pub use signature::SignatureAnalyzer;
pub use static_analysis::StaticAnalyzer;

use crate::error::{AnalysisError, AnalysisResult};
use crate::memory::{AllocationKind, AllocationRequest, Reservation};
use crate::models::AnalysisFile;
use crate::scheduler::TaskContext;
use tracing::debug;

/// Read the sample while holding an analysis-kind reservation for its size.
/// The buffer is in use until the reservation drops, so eviction must skip it.
pub(crate) async fn read_sample(
    ctx: &TaskContext,
    file: &AnalysisFile,
) -> AnalysisResult<(Vec<u8>, Reservation)> {
    let reservation = ctx.memory.reserve(
        AllocationRequest::new(ctx.allocation_id("content"), file.size, AllocationKind::Analysis)
            .description(format!("{} content for {}", ctx.technique, file.name)),
    )?;

    let content = ctx
        .cancellable(tokio::fs::read(&file.path))
        .await?
        .map_err(|e| {
            AnalysisError::technique(
                ctx.technique,
                format!("cannot read {}: {}", file.path.display(), e),
            )
        })?;
    debug!("{} read {} bytes of file {}", ctx.task_id, content.len(), ctx.file_id);

    Ok((content, reservation))
}
