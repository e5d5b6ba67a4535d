//! BOSH long-polling bridge (XEP-0124/0206).
//!
//! Each BOSH session adapts the stanza pipeline to HTTP request/response:
//! suspended requests wait in `request_queue`, outbound stanzas with no
//! request to ride on wait in `delayed_queue`. At most one of the two
//! queues is non-empty outside a single write's critical section. A
//! suspended request is a pending task completed through a oneshot sender;
//! expiry timers cascade-drain all older requests (XEP-0124 §10).
//!
//! The HTTP embedding lives in [`http`]; everything here is transport
//! agnostic and driven by parsed `<body/>` elements. TLS is the HTTP
//! layer's business: BOSH sessions start in the encrypted state and a TLS
//! switch is a no-op.

pub mod http;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::SaslFailure;
use crate::jid::BareJid;
use crate::metrics;
use crate::ns;
use crate::router;
use crate::runtime::ServerRuntimeContext;
use crate::sasl::{self, Mechanism, SaslOutcome};
use crate::session::{SessionContext, SessionControl, SessionHandle, SessionState};
use crate::stanza;
use crate::xml::Element;

/// Maximum consecutive SASL failures before the session is torn down.
const MAX_SASL_FAILURES: u8 = 5;

/// Errors surfaced to the HTTP layer.
#[derive(Debug, Error)]
pub enum BoshError {
    /// The request body is not a usable `<body/>`.
    #[error("malformed BOSH body")]
    BadRequest,

    /// The session id is unknown or terminated.
    #[error("unknown BOSH session")]
    ItemNotFound,

    /// Anything unexpected.
    #[error("internal BOSH error: {0}")]
    Internal(String),
}

/// How the HTTP layer should answer a request.
pub enum BoshReply {
    /// Respond immediately with this body.
    Now(String),
    /// Suspend; the body arrives through the channel (or the sender is
    /// dropped on teardown).
    Suspended(oneshot::Receiver<String>),
}

/// One suspended HTTP request.
struct PendingRequest {
    rid: u64,
    tx: oneshot::Sender<String>,
}

struct BoshInner {
    context: SessionContext,
    authenticated_as: Option<BareJid>,
    mechanism: Option<Box<dyn Mechanism>>,
    handle: Option<SessionHandle>,
    request_queue: VecDeque<PendingRequest>,
    delayed_queue: VecDeque<Element>,
    last_activity: Instant,
    terminated: bool,
}

/// A live BOSH session.
pub struct BoshSession {
    sid: String,
    wait: u64,
    hold: u16,
    polling: u64,
    inactivity: u64,
    inner: Mutex<BoshInner>,
}

/// Registry of BOSH sessions by sid.
#[derive(Default)]
pub struct BoshManager {
    sessions: DashMap<String, Arc<BoshSession>>,
}

impl BoshManager {
    /// Empty manager.
    pub fn new() -> BoshManager {
        BoshManager::default()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handle one parsed `<body/>` request.
    pub async fn handle_request(
        &self,
        ctx: &Arc<ServerRuntimeContext>,
        body: Element,
    ) -> Result<BoshReply, BoshError> {
        if !body.is("body", ns::HTTPBIND) {
            return Err(BoshError::BadRequest);
        }
        let rid = body
            .attr("rid")
            .and_then(|rid| rid.parse::<u64>().ok())
            .ok_or(BoshError::BadRequest)?;

        match body.attr("sid") {
            None => self.create_session(ctx, &body),
            Some(sid) => {
                let session = self
                    .sessions
                    .get(sid)
                    .map(|entry| Arc::clone(entry.value()))
                    .ok_or(BoshError::ItemNotFound)?;
                let reply = Arc::clone(&session).process(ctx, body, rid).await;
                if let Ok(BoshReply::Now(_)) = &reply {
                    // Terminated sessions answer one final body.
                    if session.is_terminated().await {
                        self.sessions.remove(session.sid());
                        metrics::record_bosh_session_closed();
                    }
                }
                reply
            }
        }
    }

    /// Negotiate and create a fresh session (request without `sid`).
    fn create_session(
        &self,
        ctx: &Arc<ServerRuntimeContext>,
        body: &Element,
    ) -> Result<BoshReply, BoshError> {
        let bosh_config = &ctx.config().bosh;
        let wait = body
            .attr("wait")
            .and_then(|wait| wait.parse::<u64>().ok())
            .unwrap_or(bosh_config.wait_max)
            .min(bosh_config.wait_max);
        let hold = body
            .attr("hold")
            .and_then(|hold| hold.parse::<u16>().ok())
            .unwrap_or(bosh_config.hold);

        let mut context = SessionContext::new_client();
        // The surrounding HTTP layer owns TLS; the handshake states are
        // skipped entirely.
        context.state = SessionState::Encrypted;
        context.encrypted = true;

        let sid = context.session_id.clone();
        let session = Arc::new(BoshSession {
            sid: sid.clone(),
            wait,
            hold,
            polling: bosh_config.polling,
            inactivity: bosh_config.inactivity,
            inner: Mutex::new(BoshInner {
                context,
                authenticated_as: None,
                mechanism: None,
                handle: None,
                request_queue: VecDeque::new(),
                delayed_queue: VecDeque::new(),
                last_activity: Instant::now(),
                terminated: false,
            }),
        });
        self.sessions.insert(sid.clone(), Arc::clone(&session));
        metrics::record_bosh_session_opened();
        info!(sid = %sid, wait = wait, hold = hold, "BOSH session created");

        let features = Element::builder("features", ns::STREAM)
            .append(sasl::build_mechanisms_feature(&sasl::offered_mechanisms(
                ctx.config(),
                true,
            )))
            .build();
        let response = render_body_with_attrs(
            vec![features],
            &[
                ("sid", sid.as_str()),
                ("wait", &wait.to_string()),
                ("hold", &hold.to_string()),
                ("requests", &(hold + 1).to_string()),
                ("polling", &bosh_config.polling.to_string()),
                ("inactivity", &bosh_config.inactivity.to_string()),
                ("from", &ctx.config().server_domain),
                ("ver", "1.8"),
            ],
        );
        Ok(BoshReply::Now(response))
    }

    /// Terminate sessions idle past their inactivity budget. Returns how
    /// many were removed; run this periodically.
    pub async fn sweep_inactive(&self, ctx: &Arc<ServerRuntimeContext>) -> usize {
        let mut expired: Vec<Arc<BoshSession>> = Vec::new();
        for entry in self.sessions.iter() {
            let session = entry.value();
            let inner = session.inner.lock().await;
            let idle = inner.last_activity.elapsed() > Duration::from_secs(session.inactivity);
            if inner.terminated || (idle && inner.request_queue.is_empty()) {
                expired.push(Arc::clone(session));
            }
        }
        let count = expired.len();
        for session in expired {
            debug!(sid = %session.sid, "Terminating inactive BOSH session");
            session.terminate(ctx).await;
            self.sessions.remove(&session.sid);
            metrics::record_bosh_session_closed();
        }
        count
    }
}

impl BoshSession {
    /// The session id.
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Negotiated `wait` in seconds.
    pub fn wait(&self) -> u64 {
        self.wait
    }

    /// Negotiated `hold`.
    pub fn hold(&self) -> u16 {
        self.hold
    }

    /// Negotiated polling interval in seconds.
    pub fn polling(&self) -> u64 {
        self.polling
    }

    async fn is_terminated(&self) -> bool {
        self.inner.lock().await.terminated
    }

    /// Process one request body addressed to this session.
    async fn process(
        self: Arc<Self>,
        ctx: &Arc<ServerRuntimeContext>,
        body: Element,
        rid: u64,
    ) -> Result<BoshReply, BoshError> {
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            return Err(BoshError::ItemNotFound);
        }
        inner.last_activity = Instant::now();

        if body.attr("type") == Some("terminate") {
            self.terminate_locked(ctx, &mut inner);
            return Ok(BoshReply::Now(render_body_with_attrs(
                Vec::new(),
                &[("type", "terminate")],
            )));
        }

        let mut immediate: Vec<Element> = Vec::new();

        if body.attr("restart") == Some("true") {
            immediate.push(self.features_for_state(ctx, &inner));
        }

        for child in body.children() {
            Self::handle_child(&self, ctx, &mut inner, child, &mut immediate).await;
            if inner.terminated {
                self.terminate_locked(ctx, &mut inner);
                return Ok(BoshReply::Now(render_body_with_attrs(
                    immediate,
                    &[("type", "terminate")],
                )));
            }
        }

        if !immediate.is_empty() {
            return Ok(BoshReply::Now(render_body(immediate)));
        }

        // Empty-handed request: suspend it.
        let (tx, rx) = oneshot::channel();
        inner.request_queue.push_back(PendingRequest { rid, tx });

        if !inner.delayed_queue.is_empty() {
            // Pending stanzas ride out on the oldest suspended request.
            let stanzas: Vec<Element> = inner.delayed_queue.drain(..).collect();
            if let Some(request) = inner.request_queue.pop_front() {
                let _ = request.tx.send(render_body(stanzas));
            }
        } else if inner.request_queue.len() > self.hold as usize {
            // Too many held requests: release the oldest, empty.
            if let Some(request) = inner.request_queue.pop_front() {
                let _ = request.tx.send(render_body(Vec::new()));
            }
        }

        let session = Arc::clone(&self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(session.wait)).await;
            session.expire_request(rid).await;
        });

        Ok(BoshReply::Suspended(rx))
    }

    /// Handle one child element of a request body.
    async fn handle_child(
        session: &Arc<BoshSession>,
        ctx: &Arc<ServerRuntimeContext>,
        inner: &mut BoshInner,
        child: &Element,
        immediate: &mut Vec<Element>,
    ) {
        if let Some((mechanism_name, payload)) = sasl::parse_auth(child) {
            let offered = sasl::offered_mechanisms(ctx.config(), true);
            let kind = offered
                .into_iter()
                .find(|kind| kind.as_str() == mechanism_name);
            match kind {
                Some(kind) => {
                    let mut mechanism = sasl::create_mechanism(
                        kind,
                        Arc::clone(ctx.accounts()),
                        ctx.config().server_domain.clone(),
                    );
                    let outcome = mechanism.step(&payload).await;
                    session.apply_sasl_outcome(inner, mechanism, outcome, immediate);
                }
                None => {
                    immediate.push(sasl::build_failure(SaslFailure::InvalidMechanism));
                }
            }
            return;
        }

        if let Some(payload) = sasl::parse_response(child) {
            match inner.mechanism.take() {
                Some(mut mechanism) => {
                    let outcome = mechanism.step(&payload).await;
                    session.apply_sasl_outcome(inner, mechanism, outcome, immediate);
                }
                None => immediate.push(sasl::build_failure(SaslFailure::MalformedRequest)),
            }
            return;
        }

        if child.name() == "iq" {
            if let Some(requested) = stanza::bind_request(child) {
                Self::bind_resource(session, ctx, inner, child, requested, immediate).await;
                return;
            }
            if child.has_child("session", ns::SESSION) && inner.context.state == SessionState::Bound
            {
                immediate.push(stanza::make_iq_result(
                    child,
                    Some(&ctx.config().server_domain),
                    None,
                ));
                return;
            }
        }

        if stanza::is_stanza(child) && inner.context.state == SessionState::Bound {
            let sender = match &inner.context.bound {
                Some(full) => full.clone(),
                None => return,
            };
            let result = if child.name() == "presence" {
                router::handle_outbound_presence(ctx, &sender, child.clone()).await
            } else {
                router::route_stanza(ctx, child.clone(), Some(&sender)).await
            };
            if let Err(err) = result {
                warn!(sid = %session.sid, error = %err, "Failed to route BOSH stanza");
            }
            return;
        }

        debug!(sid = %session.sid, name = child.name(), "Ignoring BOSH body child");
    }

    fn apply_sasl_outcome(
        &self,
        inner: &mut BoshInner,
        mechanism: Box<dyn Mechanism>,
        outcome: SaslOutcome,
        immediate: &mut Vec<Element>,
    ) {
        match outcome {
            SaslOutcome::Challenge(data) => {
                inner.mechanism = Some(mechanism);
                immediate.push(sasl::build_challenge(&data));
            }
            SaslOutcome::Success {
                identity,
                additional_data,
            } => {
                inner.context.authenticated = true;
                inner.context.state = SessionState::Authenticated;
                inner.context.sasl_failures = 0;
                inner.authenticated_as = Some(identity.jid);
                immediate.push(sasl::build_success(additional_data.as_deref()));
            }
            SaslOutcome::Failure(failure) => {
                inner.context.sasl_failures += 1;
                metrics::record_sasl_failure();
                immediate.push(sasl::build_failure(failure));
                if inner.context.sasl_failures >= MAX_SASL_FAILURES {
                    warn!(sid = %self.sid, "Too many SASL failures, terminating BOSH session");
                    inner.terminated = true;
                }
            }
        }
    }

    async fn bind_resource(
        session: &Arc<BoshSession>,
        ctx: &Arc<ServerRuntimeContext>,
        inner: &mut BoshInner,
        iq: &Element,
        requested: Option<String>,
        immediate: &mut Vec<Element>,
    ) {
        if inner.context.state != SessionState::Authenticated {
            immediate.push(stanza::make_error_reply(
                iq,
                crate::error::StanzaErrorCondition::NotAuthorized,
                None,
            ));
            return;
        }
        let Some(bare) = inner.authenticated_as.clone() else {
            immediate.push(stanza::make_error_reply(
                iq,
                crate::error::StanzaErrorCondition::NotAuthorized,
                None,
            ));
            return;
        };
        let resource =
            requested.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let full = match bare.with_resource(&resource) {
            Ok(full) => full,
            Err(_) => {
                immediate.push(stanza::make_error_reply(
                    iq,
                    crate::error::StanzaErrorCondition::BadRequest,
                    None,
                ));
                return;
            }
        };

        let (handle, stanza_rx, control_rx) = SessionHandle::channel(&inner.context.session_id);
        match ctx
            .routing()
            .bind(full.clone(), handle.clone(), ctx.next_bind_seq())
        {
            Ok(()) => {
                inner.context.bound = Some(full.clone());
                inner.context.state = SessionState::Bound;
                inner.handle = Some(handle);
                metrics::record_session_opened();
                tokio::spawn(relay_outbound(
                    Arc::clone(session),
                    Arc::clone(ctx),
                    stanza_rx,
                    control_rx,
                ));
                immediate.push(stanza::make_bind_result(iq, &full));
                info!(sid = %session.sid, jid = %full, "BOSH resource bound");
            }
            Err(router::BindError::Conflict) => {
                immediate.push(stanza::make_error_reply(
                    iq,
                    crate::error::StanzaErrorCondition::Conflict,
                    None,
                ));
            }
        }
    }

    /// A routed stanza wants out: attach it to a suspended request or park
    /// it in the delayed queue.
    pub async fn queue_stanza(&self, mut stanza: Element) {
        stanza.rescope_default_ns(ns::SERVER, ns::CLIENT);
        let mut inner = self.inner.lock().await;
        if inner.terminated {
            debug!(sid = %self.sid, "Dropping stanza for terminated BOSH session");
            return;
        }
        match inner.request_queue.pop_front() {
            Some(request) => {
                let _ = request.tx.send(render_body(vec![stanza]));
            }
            None => inner.delayed_queue.push_back(stanza),
        }
    }

    /// A suspended request hit its `wait` deadline: answer it empty, along
    /// with every older request still suspended.
    pub async fn expire_request(&self, rid: u64) {
        let mut inner = self.inner.lock().await;
        if !inner.request_queue.iter().any(|request| request.rid == rid) {
            return;
        }
        while let Some(request) = inner.request_queue.pop_front() {
            let expired = request.rid == rid;
            let _ = request.tx.send(render_body(Vec::new()));
            if expired {
                break;
            }
        }
    }

    /// Tear the session down, releasing all suspended requests.
    pub async fn terminate(&self, ctx: &Arc<ServerRuntimeContext>) {
        let mut inner = self.inner.lock().await;
        self.terminate_locked(ctx, &mut inner);
    }

    fn terminate_locked(&self, ctx: &Arc<ServerRuntimeContext>, inner: &mut BoshInner) {
        if inner.terminated && inner.request_queue.is_empty() {
            return;
        }
        inner.terminated = true;
        while let Some(request) = inner.request_queue.pop_front() {
            let _ = request
                .tx
                .send(render_body_with_attrs(Vec::new(), &[("type", "terminate")]));
        }
        inner.delayed_queue.clear();
        if let Some(handle) = inner.handle.take() {
            handle.mark_closed();
            metrics::record_session_closed();
        }
        if let Some(full) = inner.context.bound.take() {
            ctx.routing().unbind(&full);
        }
        inner.context.state = SessionState::Closed;
        debug!(sid = %self.sid, "BOSH session terminated");
    }

    fn features_for_state(&self, ctx: &Arc<ServerRuntimeContext>, inner: &BoshInner) -> Element {
        let mut features = Element::new("features", ns::STREAM);
        match inner.context.state {
            SessionState::Authenticated | SessionState::Bound => {
                features.append_child(Element::new("bind", ns::BIND));
                features.append_child(Element::new("session", ns::SESSION));
            }
            _ => {
                features.append_child(sasl::build_mechanisms_feature(
                    &sasl::offered_mechanisms(ctx.config(), true),
                ));
            }
        }
        features
    }
}

/// Pump routed stanzas from the session handle into the BOSH queues.
async fn relay_outbound(
    session: Arc<BoshSession>,
    ctx: Arc<ServerRuntimeContext>,
    mut stanza_rx: mpsc::Receiver<Element>,
    mut control_rx: mpsc::UnboundedReceiver<SessionControl>,
) {
    loop {
        tokio::select! {
            stanza = stanza_rx.recv() => match stanza {
                Some(stanza) => session.queue_stanza(stanza).await,
                None => break,
            },
            control = control_rx.recv() => match control {
                Some(SessionControl::Close(_)) | None => {
                    session.terminate(&ctx).await;
                    break;
                }
            },
        }
    }
}

/// Render a `<body/>` wrapper with stanza children.
fn render_body(children: Vec<Element>) -> String {
    render_body_with_attrs(children, &[])
}

fn render_body_with_attrs(children: Vec<Element>, attrs: &[(&str, &str)]) -> String {
    let mut body = Element::new("body", ns::HTTPBIND);
    for (name, value) in attrs {
        body.set_attr(*name, *value);
    }
    for child in children {
        body.append_child(child);
    }
    body.to_xml()
}
