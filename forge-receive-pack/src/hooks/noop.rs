//! No-operation extender.

use async_trait::async_trait;

use super::{ExtenderContext, HookOutput, PostReceiveExtender, PreReceiveExtender};
use crate::Error;

/// An extender that allows everything and produces no output.
///
/// This is what the pipeline uses when no extender is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExtender;

#[async_trait]
impl PreReceiveExtender for NoopExtender {
    async fn extend(&self, _ctx: ExtenderContext<'_>, _out: &mut HookOutput) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl PostReceiveExtender for NoopExtender {
    async fn extend(&self, _ctx: ExtenderContext<'_>, _out: &mut HookOutput) -> Result<(), Error> {
        Ok(())
    }
}
