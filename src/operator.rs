use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type OperatorError = Box<dyn std::error::Error + Send + Sync>;
pub type OperatorResult = Result<Value, OperatorError>;
pub type BoxOperator = Arc<dyn Operator>;

/// A pluggable unit of work.
///
/// Everything an operator needs is bound when it is constructed; the job only
/// hands it a cancellation token it may watch while running.
#[async_trait]
pub trait Operator: Send + Sync {
    async fn run(&self, ctx: CancellationToken) -> OperatorResult;
}

/// Adapts a plain synchronous closure into an [`Operator`].
pub struct FnOperator<F> {
    f: F,
}

#[async_trait]
impl<F> Operator for FnOperator<F>
where
    F: Fn() -> OperatorResult + Send + Sync,
{
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        (self.f)()
    }
}

pub fn from_fn<F>(f: F) -> FnOperator<F>
where
    F: Fn() -> OperatorResult + Send + Sync,
{
    FnOperator { f }
}
