use anyhow::Context;
use async_trait::async_trait;

use crate::{
    elements::key_patterns,
    types::{ElementIndex, JobType},
};

use super::{
    context::SubchainContext,
    job::{Job, Work},
};

/// Turns new key material into match patterns.
pub(crate) struct IndexJob;

impl IndexJob {
    async fn index(&self, ctx: &SubchainContext, rows: Vec<(ElementIndex, Vec<u8>)>) -> anyhow::Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        ctx.db
            .add_patterns(&ctx.id, &rows)
            .await
            .context("persist patterns")?;
        let added = ctx.elements.write().extend_patterns(rows);
        tracing::debug!(subchain = %ctx.id, added, "patterns indexed");
        if added > 0 {
            ctx.router.notify(JobType::Rescan, Work::NewElements);
            ctx.router.notify(JobType::Scan, Work::StateMachine);
        }
        Ok(())
    }
}

#[async_trait]
impl Job for IndexJob {
    fn kind(&self) -> JobType {
        JobType::Index
    }

    async fn work(&mut self, ctx: &SubchainContext, work: Work) -> anyhow::Result<()> {
        match work {
            Work::Key(keys) => {
                let rows = keys
                    .iter()
                    .flat_map(|(index, key)| key_patterns(key).into_iter().map(move |p| (*index, p)))
                    .collect();
                self.index(ctx, rows).await
            }
            Work::Patterns(rows) => self.index(ctx, rows).await,
            _ => Ok(()),
        }
    }

    async fn state_machine(&mut self, _ctx: &SubchainContext) -> anyhow::Result<bool> {
        Ok(false)
    }
}
