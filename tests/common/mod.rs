#![allow(dead_code)]

use async_trait::async_trait;
use dagflow::{DagflowError, Operator, OperatorResult, Store};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use tokio_util::sync::CancellationToken;

/// Adds two non-negative numbers.
pub struct Addition(pub i64, pub i64);

#[async_trait]
impl Operator for Addition {
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        if self.0 < 0 || self.1 < 0 {
            return Err("can't add negative numbers".into());
        }
        Ok(json!(self.0 + self.1))
    }
}

pub struct Sleep(pub Duration);

#[async_trait]
impl Operator for Sleep {
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        tokio::time::sleep(self.0).await;
        Ok(json!(true))
    }
}

/// Fails `failures` times, then succeeds. Counts every call.
#[derive(Clone, Default)]
pub struct Flaky {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

impl Flaky {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always() -> Self {
        Self::new(u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operator for Flaky {
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            Err(format!("attempt {} failed", call + 1).into())
        } else {
            Ok(json!(call + 1))
        }
    }
}

/// Blocks until every party of the barrier has arrived.
pub struct Rendezvous(pub Arc<Barrier>);

#[async_trait]
impl Operator for Rendezvous {
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        self.0.wait().await;
        Ok(json!("met"))
    }
}

/// Blocks until released through the shared `Notify`.
pub struct Gate(pub Arc<Notify>);

#[async_trait]
impl Operator for Gate {
    async fn run(&self, _ctx: CancellationToken) -> OperatorResult {
        self.0.notified().await;
        Ok(json!("released"))
    }
}

/// Runs until its cancellation token fires.
pub struct UntilCancelled;

#[async_trait]
impl Operator for UntilCancelled {
    async fn run(&self, ctx: CancellationToken) -> OperatorResult {
        ctx.cancelled().await;
        Err("cancelled".into())
    }
}

/// A store whose every call fails.
pub struct BrokenStore;

#[async_trait]
impl Store for BrokenStore {
    async fn set(&self, key: &str, _value: Value) -> Result<(), DagflowError> {
        Err(DagflowError::Store(format!("cannot write {key}")))
    }

    async fn get(&self, key: &str) -> Result<Option<Value>, DagflowError> {
        Err(DagflowError::Store(format!("cannot read {key}")))
    }
}
