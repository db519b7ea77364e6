// Operation handler registry: ordered chains of pluggable handlers per
// operation kind. The session loop invokes chains and turns their result
// codes into responses; handlers never see the wire.

use crate::ber::BerNode;
use crate::protocol::{Control, ResultCode};
use crate::server::ClientConn;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Search-chain failure carrying the result code to report in the final
/// search-done response.
#[derive(Debug, thiserror::Error)]
#[error("{text} ({code:?})")]
pub struct OperationError {
    pub code: ResultCode,
    pub text: String,
}

impl OperationError {
    pub fn new(code: ResultCode, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }
}

#[async_trait]
pub trait BindHandler: Send + Sync {
    /// `request` is the bind-request operation node (version, name,
    /// credential). Synthetic service binds arrive through the same call.
    async fn bind(&self, request: &BerNode, conn: &mut ClientConn) -> anyhow::Result<ResultCode>;
}

#[async_trait]
pub trait SearchHandler: Send + Sync {
    /// Streams zero or more entries directly to `conn` (in order), then
    /// returns the completion code. The final search-done is sent by the
    /// session loop.
    async fn search(
        &self,
        request: &BerNode,
        controls: &[Control],
        message_id: u64,
        bound_dn: &str,
        conn: &mut ClientConn,
    ) -> Result<ResultCode, OperationError>;
}

/// Handler for the single-response operations: add, modify, delete,
/// modify-DN, compare, extended.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(
        &self,
        request: &BerNode,
        bound_dn: &str,
        conn: &mut ClientConn,
    ) -> anyhow::Result<ResultCode>;
}

#[async_trait]
pub trait AbandonHandler: Send + Sync {
    async fn abandon(&self, request: &BerNode, bound_dn: &str, conn: &mut ClientConn);
}

/// Invoked exactly once at session end with the final bound identity.
#[async_trait]
pub trait CloseHandler: Send + Sync {
    async fn close(&self, bound_dn: &str, conn: &mut ClientConn);
}

#[derive(Default)]
pub struct HandlerRegistry {
    bind: Vec<Arc<dyn BindHandler>>,
    search: Vec<Arc<dyn SearchHandler>>,
    add: Vec<Arc<dyn OperationHandler>>,
    modify: Vec<Arc<dyn OperationHandler>>,
    delete: Vec<Arc<dyn OperationHandler>>,
    modify_dn: Vec<Arc<dyn OperationHandler>>,
    compare: Vec<Arc<dyn OperationHandler>>,
    extended: Vec<Arc<dyn OperationHandler>>,
    abandon: Vec<Arc<dyn AbandonHandler>>,
    close: Vec<Arc<dyn CloseHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_bind(mut self, h: Arc<dyn BindHandler>) -> Self {
        self.bind.push(h);
        self
    }

    pub fn on_search(mut self, h: Arc<dyn SearchHandler>) -> Self {
        self.search.push(h);
        self
    }

    pub fn on_add(mut self, h: Arc<dyn OperationHandler>) -> Self {
        self.add.push(h);
        self
    }

    pub fn on_modify(mut self, h: Arc<dyn OperationHandler>) -> Self {
        self.modify.push(h);
        self
    }

    pub fn on_delete(mut self, h: Arc<dyn OperationHandler>) -> Self {
        self.delete.push(h);
        self
    }

    pub fn on_modify_dn(mut self, h: Arc<dyn OperationHandler>) -> Self {
        self.modify_dn.push(h);
        self
    }

    pub fn on_compare(mut self, h: Arc<dyn OperationHandler>) -> Self {
        self.compare.push(h);
        self
    }

    pub fn on_extended(mut self, h: Arc<dyn OperationHandler>) -> Self {
        self.extended.push(h);
        self
    }

    pub fn on_abandon(mut self, h: Arc<dyn AbandonHandler>) -> Self {
        self.abandon.push(h);
        self
    }

    pub fn on_close(mut self, h: Arc<dyn CloseHandler>) -> Self {
        self.close.push(h);
        self
    }

    /// Runs the bind chain: first Success wins, otherwise the last handler's
    /// code; a handler error maps to operationsError. An empty chain rejects
    /// with invalidCredentials.
    pub async fn run_bind(&self, request: &BerNode, conn: &mut ClientConn) -> ResultCode {
        let mut last = ResultCode::InvalidCredentials;
        for h in &self.bind {
            match h.bind(request, conn).await {
                Ok(ResultCode::Success) => return ResultCode::Success,
                Ok(code) => last = code,
                Err(e) => {
                    warn!("bind handler failed: {:#}", e);
                    return ResultCode::OperationsError;
                }
            }
        }
        last
    }

    /// Runs the search chain in order: the first handler returning Success
    /// (or failing) settles the result; entry order is whatever the handlers
    /// streamed, in chain order.
    pub async fn run_search(
        &self,
        request: &BerNode,
        controls: &[Control],
        message_id: u64,
        bound_dn: &str,
        conn: &mut ClientConn,
    ) -> Result<ResultCode, OperationError> {
        let mut last = ResultCode::UnwillingToPerform;
        for h in &self.search {
            match h.search(request, controls, message_id, bound_dn, conn).await? {
                ResultCode::Success => return Ok(ResultCode::Success),
                code => last = code,
            }
        }
        Ok(last)
    }

    pub async fn run_operation(
        &self,
        kind: ChainKind,
        request: &BerNode,
        bound_dn: &str,
        conn: &mut ClientConn,
    ) -> ResultCode {
        let chain = match kind {
            ChainKind::Add => &self.add,
            ChainKind::Modify => &self.modify,
            ChainKind::Delete => &self.delete,
            ChainKind::ModifyDn => &self.modify_dn,
            ChainKind::Compare => &self.compare,
            ChainKind::Extended => &self.extended,
        };
        let mut last = ResultCode::UnwillingToPerform;
        for h in chain {
            match h.handle(request, bound_dn, conn).await {
                Ok(ResultCode::Success) => return ResultCode::Success,
                Ok(code) => last = code,
                Err(e) => {
                    warn!("{:?} handler failed: {:#}", kind, e);
                    return ResultCode::OperationsError;
                }
            }
        }
        last
    }

    /// Abandon fans out to every handler; there is no result.
    pub async fn run_abandon(&self, request: &BerNode, bound_dn: &str, conn: &mut ClientConn) {
        for h in &self.abandon {
            h.abandon(request, bound_dn, conn).await;
        }
    }

    /// Best-effort fan-out at session end.
    pub async fn run_close(&self, bound_dn: &str, conn: &mut ClientConn) {
        for h in &self.close {
            h.close(bound_dn, conn).await;
        }
    }
}

/// Selector for the generic single-response chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainKind {
    Add,
    Modify,
    Delete,
    ModifyDn,
    Compare,
    Extended,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::{BerClass, BerNode, TAG_SEQUENCE};
    use crate::server::ClientConn;

    struct FixedBind(ResultCode);

    #[async_trait]
    impl BindHandler for FixedBind {
        async fn bind(&self, _req: &BerNode, _conn: &mut ClientConn) -> anyhow::Result<ResultCode> {
            Ok(self.0)
        }
    }

    struct FailingBind;

    #[async_trait]
    impl BindHandler for FailingBind {
        async fn bind(&self, _req: &BerNode, _conn: &mut ClientConn) -> anyhow::Result<ResultCode> {
            anyhow::bail!("backend unavailable")
        }
    }

    fn test_conn() -> ClientConn {
        let (_client, server) = tokio::io::duplex(1024);
        ClientConn::new(server, "test".to_string())
    }

    fn dummy_request() -> BerNode {
        BerNode::sequence(BerClass::Application, 0)
    }

    #[tokio::test]
    async fn test_bind_chain_first_success_wins() {
        let registry = HandlerRegistry::new()
            .on_bind(Arc::new(FixedBind(ResultCode::InvalidCredentials)))
            .on_bind(Arc::new(FixedBind(ResultCode::Success)));
        let mut conn = test_conn();
        let code = registry.run_bind(&dummy_request(), &mut conn).await;
        assert_eq!(code, ResultCode::Success);
    }

    #[tokio::test]
    async fn test_bind_chain_last_code_when_no_success() {
        let registry = HandlerRegistry::new()
            .on_bind(Arc::new(FixedBind(ResultCode::Busy)))
            .on_bind(Arc::new(FixedBind(ResultCode::InvalidCredentials)));
        let mut conn = test_conn();
        let code = registry.run_bind(&dummy_request(), &mut conn).await;
        assert_eq!(code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_bind_chain_empty_rejects() {
        let registry = HandlerRegistry::new();
        let mut conn = test_conn();
        let code = registry.run_bind(&dummy_request(), &mut conn).await;
        assert_eq!(code, ResultCode::InvalidCredentials);
    }

    #[tokio::test]
    async fn test_bind_chain_error_maps_to_operations_error() {
        let registry = HandlerRegistry::new().on_bind(Arc::new(FailingBind));
        let mut conn = test_conn();
        let code = registry.run_bind(&dummy_request(), &mut conn).await;
        assert_eq!(code, ResultCode::OperationsError);
    }

    struct FixedOp(ResultCode);

    #[async_trait]
    impl OperationHandler for FixedOp {
        async fn handle(
            &self,
            _req: &BerNode,
            _dn: &str,
            _conn: &mut ClientConn,
        ) -> anyhow::Result<ResultCode> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn test_operation_chain_empty_is_unwilling() {
        let registry = HandlerRegistry::new();
        let mut conn = test_conn();
        let req = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
        let code = registry
            .run_operation(ChainKind::Add, &req, "", &mut conn)
            .await;
        assert_eq!(code, ResultCode::UnwillingToPerform);
    }

    #[tokio::test]
    async fn test_operation_chain_routes_by_kind() {
        let registry = HandlerRegistry::new()
            .on_add(Arc::new(FixedOp(ResultCode::Success)))
            .on_delete(Arc::new(FixedOp(ResultCode::NoSuchObject)));
        let mut conn = test_conn();
        let req = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
        assert_eq!(
            registry.run_operation(ChainKind::Add, &req, "", &mut conn).await,
            ResultCode::Success
        );
        assert_eq!(
            registry.run_operation(ChainKind::Delete, &req, "", &mut conn).await,
            ResultCode::NoSuchObject
        );
        assert_eq!(
            registry.run_operation(ChainKind::Modify, &req, "", &mut conn).await,
            ResultCode::UnwillingToPerform
        );
    }
}
