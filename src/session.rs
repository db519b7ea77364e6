// Per-connection session core: reads one envelope at a time, keeps the
// connection's authentication state, routes each operation through the
// handler registry and writes the response.
//
// The non-standard part is transparent credential forwarding: when a client
// has not supplied an identity (anonymous/empty bind, or a search before any
// bind), the session synthesizes a bind for the configured service identity,
// runs it through the ordinary bind chain and adopts its outcome as the
// connection's effective identity. The client never issued that bind; it only
// sees its own operation succeed.

use crate::ber::{BerClass, BerNode, BerType, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE};
use crate::config::ServiceIdentity;
use crate::handler::{ChainKind, HandlerRegistry};
use crate::protocol::{
    self, decode_control, Control, OperationKind, ResultCode, APP_ADD_RESPONSE, APP_BIND_REQUEST,
};
use crate::server::ClientConn;
use crate::stats::Stats;
use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Message identifier of the synthetic service bind and its response. Client
/// message identifiers are expected to start at 1 (RFC 4511), so 0 stays out
/// of band.
const SERVICE_BIND_MESSAGE_ID: u64 = 0;

const LDAP_VERSION: i64 = 3;

/// Per-connection state, owned and mutated by the session loop only.
#[derive(Debug, Default)]
struct SessionState {
    /// Effective identity; empty means anonymous.
    bound_dn: String,
    /// Whether the service bind has been attempted. Set at most once, never
    /// reset, so forwarding happens at most once per connection.
    has_forwarded: bool,
}

/// What the loop does after handling one message.
enum Flow {
    Continue,
    Terminate,
}

/// Result of a service-bind forwarding attempt.
enum ForwardOutcome {
    Established,
    Rejected,
}

#[derive(Clone)]
pub struct Session {
    registry: Arc<HandlerRegistry>,
    stats: Arc<Stats>,
    service: Arc<ServiceIdentity>,
}

impl Session {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        stats: Arc<Stats>,
        service: Arc<ServiceIdentity>,
    ) -> Self {
        Self {
            registry,
            stats,
            service,
        }
    }

    /// Runs the session to completion. Whatever path ends the loop, the
    /// close chain runs exactly once with the final bound identity before
    /// the connection is released.
    pub async fn run(self, mut conn: ClientConn) {
        let mut state = SessionState::default();
        if let Err(e) = self.serve(&mut conn, &mut state).await {
            warn!("session {} ended: {:#}", conn.peer(), e);
        }
        self.registry.run_close(&state.bound_dn, &mut conn).await;
    }

    async fn serve(&self, conn: &mut ClientConn, state: &mut SessionState) -> Result<()> {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            let envelope = match conn.read_envelope(&mut buf).await? {
                Some(envelope) => envelope,
                None => {
                    debug!("client {} disconnected", conn.peer());
                    return Ok(());
                }
            };

            // Structural violations terminate without a response; the peer
            // is assumed to be sending an unparseable stream.
            let message_id = validate_envelope(&envelope)?;
            let request_tag = envelope.children[1].tag;

            let flow = match OperationKind::from_tag(request_tag) {
                Some(kind) => {
                    debug!(
                        "handling {} [msgid {}] from {}",
                        kind.name(),
                        message_id,
                        conn.peer()
                    );
                    self.dispatch(kind, conn, state, message_id, &envelope).await?
                }
                None => self.reject_unsupported(conn, message_id, request_tag).await?,
            };

            if let Flow::Terminate = flow {
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &self,
        kind: OperationKind,
        conn: &mut ClientConn,
        state: &mut SessionState,
        message_id: u64,
        envelope: &BerNode,
    ) -> Result<Flow> {
        let request = &envelope.children[1];
        match kind {
            OperationKind::Bind => self.handle_bind(conn, state, message_id, request).await,
            OperationKind::Search => {
                let controls = collect_controls(envelope);
                self.handle_search(conn, state, message_id, request, &controls)
                    .await
            }
            OperationKind::Unbind => {
                self.stats.count_unbind();
                Ok(Flow::Terminate)
            }
            OperationKind::Abandon => {
                self.registry
                    .run_abandon(request, &state.bound_dn, conn)
                    .await;
                Ok(Flow::Terminate)
            }
            OperationKind::Add => {
                self.handle_generic(kind, ChainKind::Add, conn, state, message_id, request)
                    .await
            }
            OperationKind::Modify => {
                self.handle_generic(kind, ChainKind::Modify, conn, state, message_id, request)
                    .await
            }
            OperationKind::Delete => {
                self.handle_generic(kind, ChainKind::Delete, conn, state, message_id, request)
                    .await
            }
            OperationKind::ModifyDn => {
                self.handle_generic(kind, ChainKind::ModifyDn, conn, state, message_id, request)
                    .await
            }
            OperationKind::Compare => {
                self.handle_generic(kind, ChainKind::Compare, conn, state, message_id, request)
                    .await
            }
            OperationKind::Extended => {
                self.handle_generic(kind, ChainKind::Extended, conn, state, message_id, request)
                    .await
            }
        }
    }

    async fn handle_bind(
        &self,
        conn: &mut ClientConn,
        state: &mut SessionState,
        message_id: u64,
        request: &BerNode,
    ) -> Result<Flow> {
        self.stats.count_bind();
        let code = self.registry.run_bind(request, conn).await;
        if code == ResultCode::Success {
            let dn = request
                .children
                .get(1)
                .and_then(BerNode::as_text)
                .context("malformed bind DN in request")?;
            state.bound_dn = dn.to_string();
        }
        conn.send(&protocol::bind_response(message_id, code)).await?;

        if code == ResultCode::Success
            && !state.has_forwarded
            && has_empty_octet_string(request)
        {
            debug!(
                "bind credential from {} judged empty; forwarding service bind",
                conn.peer()
            );
            if let ForwardOutcome::Rejected = self.forward_service_bind(conn, state).await? {
                return Ok(Flow::Terminate);
            }
        }
        Ok(Flow::Continue)
    }

    async fn handle_search(
        &self,
        conn: &mut ClientConn,
        state: &mut SessionState,
        message_id: u64,
        request: &BerNode,
        controls: &[Control],
    ) -> Result<Flow> {
        // First search on a connection that never established an identity:
        // forward the service bind before dispatching.
        if !state.has_forwarded && state.bound_dn.is_empty() {
            if let ForwardOutcome::Rejected = self.forward_service_bind(conn, state).await? {
                return Ok(Flow::Terminate);
            }
        }

        self.stats.count_search();
        match self
            .registry
            .run_search(request, controls, message_id, &state.bound_dn, conn)
            .await
        {
            Ok(code) => {
                conn.send(&protocol::search_done(message_id, code)).await?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                warn!("search handler failed for {}: {}", conn.peer(), e);
                conn.send(&protocol::search_done(message_id, e.code)).await?;
                Ok(Flow::Terminate)
            }
        }
    }

    async fn handle_generic(
        &self,
        kind: OperationKind,
        chain: ChainKind,
        conn: &mut ClientConn,
        state: &mut SessionState,
        message_id: u64,
        request: &BerNode,
    ) -> Result<Flow> {
        let code = self
            .registry
            .run_operation(chain, request, &state.bound_dn, conn)
            .await;
        let tag = kind
            .response_tag()
            .with_context(|| format!("{} has no response shape", kind.name()))?;
        conn.send(&protocol::operation_response(
            message_id,
            tag,
            code,
            code.text(),
        ))
        .await?;
        Ok(Flow::Continue)
    }

    async fn reject_unsupported(
        &self,
        conn: &mut ClientConn,
        message_id: u64,
        tag: u8,
    ) -> Result<Flow> {
        warn!("unhandled operation tag {} from {}", tag, conn.peer());
        // Historic wire behavior: the rejection is always shaped as an
        // add-response, whatever the request was.
        conn.send(&protocol::operation_response(
            message_id,
            APP_ADD_RESPONSE,
            ResultCode::OperationsError,
            "Unsupported operation: add",
        ))
        .await?;
        Ok(Flow::Terminate)
    }

    /// Synthesizes a bind for the configured service identity, submits it
    /// through the bind chain like any wire bind (stats included), adopts
    /// the identity on success and answers the client with a bind response
    /// under the reserved message id 0. Attempted at most once per
    /// connection; a rejected service bind ends the session.
    async fn forward_service_bind(
        &self,
        conn: &mut ClientConn,
        state: &mut SessionState,
    ) -> Result<ForwardOutcome> {
        let envelope = make_service_bind(&self.service);
        let request = &envelope.children[1];

        self.stats.count_bind();
        let code = self.registry.run_bind(request, conn).await;

        let outcome = if code == ResultCode::Success {
            let dn = request
                .children
                .get(1)
                .and_then(BerNode::as_text)
                .context("service bind request is missing its DN")?;
            state.bound_dn = dn.to_string();
            info!(
                "service bind established identity {} for {}",
                dn,
                conn.peer()
            );
            ForwardOutcome::Established
        } else {
            warn!("service bind rejected ({:?}) for {}", code, conn.peer());
            ForwardOutcome::Rejected
        };
        state.has_forwarded = true;

        conn.send(&protocol::bind_response(SERVICE_BIND_MESSAGE_ID, code))
            .await?;
        Ok(outcome)
    }
}

/// Checks the envelope invariant: at least message id + operation node, the
/// id an unsigned integer, the operation node application-class.
fn validate_envelope(envelope: &BerNode) -> Result<u64> {
    if envelope.children.len() < 2 {
        bail!(
            "envelope has {} children, expected at least 2",
            envelope.children.len()
        );
    }
    let message_id = envelope.children[0]
        .as_unsigned()
        .context("malformed message identifier")?;
    if envelope.children[1].class != BerClass::Application {
        bail!("operation node is not application class");
    }
    Ok(message_id)
}

/// Optional third envelope child: a sequence of request controls, collected
/// raw and passed through to handlers.
fn collect_controls(envelope: &BerNode) -> Vec<Control> {
    match envelope.children.get(2) {
        Some(node) => node.children.iter().map(decode_control).collect(),
        None => Vec::new(),
    }
}

/// Depth-first scan of the whole subtree for any zero-length primitive
/// universal octet string. Deliberately position-blind: the scan does not
/// know which field is the credential, so an empty DN, an empty password or
/// any other empty string in the request all count as "no credential
/// supplied". Narrowing this to the credential field would change forwarding
/// behavior.
pub(crate) fn has_empty_octet_string(node: &BerNode) -> bool {
    if node.class == BerClass::Universal
        && node.ber_type == BerType::Primitive
        && node.tag == TAG_OCTET_STRING
        && node.content.is_empty()
    {
        return true;
    }
    node.children.iter().any(has_empty_octet_string)
}

/// Builds the synthetic bind envelope: message id 0, protocol version 3,
/// service DN as a universal octet string, password as a context-[0]
/// simple credential. Never read from the wire; built fresh per attempt.
fn make_service_bind(identity: &ServiceIdentity) -> BerNode {
    let mut envelope = BerNode::sequence(BerClass::Universal, TAG_SEQUENCE);
    envelope.append(BerNode::integer(
        BerClass::Universal,
        TAG_INTEGER,
        SERVICE_BIND_MESSAGE_ID as i64,
    ));
    let mut bind = BerNode::sequence(BerClass::Application, APP_BIND_REQUEST);
    bind.append(BerNode::integer(BerClass::Universal, TAG_INTEGER, LDAP_VERSION));
    bind.append(BerNode::octet_string(&identity.bind_dn));
    bind.append(BerNode::text(BerClass::Context, 0, &identity.password));
    envelope.append(bind);
    envelope
}
