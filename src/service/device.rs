use crate::common::config::Config;
use crate::common::{Result, RidgelineError};
use crate::core::matcher::{subject_in_namespace, MatchEngine};
use crate::sensor::FrameSource;
use crate::service::authority::{
    spawn_check, AuthDecision, Authority, ACTION_ENROLL, ACTION_VERIFY,
};
use crate::service::events::{DeviceEvent, EnrollResult, VerifyResult};
use crate::service::session::SessionState;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub use crate::service::session::ConnId;

/// Join budget when replacing or tearing down a scan loop.
const SCAN_JOIN_BUDGET: Duration = Duration::from_secs(2);

enum Command {
    Claim {
        identity: String,
        conn: ConnId,
        reply: Sender<Result<()>>,
    },
    Release {
        conn: ConnId,
        reply: Sender<Result<()>>,
    },
    VerifyStart {
        conn: ConnId,
        finger_hint: String,
        reply: Sender<Result<()>>,
    },
    EnrollStart {
        conn: ConnId,
        finger_label: String,
        reply: Sender<Result<()>>,
    },
    Cancel {
        conn: ConnId,
        reply: Sender<Result<()>>,
    },
    ListFingers {
        user: String,
        reply: Sender<Result<Vec<String>>>,
    },
    DeleteFingers {
        requester: String,
        user: String,
        reply: Sender<Result<()>>,
    },
    Suspend {
        reply: Sender<Result<()>>,
    },
    Resume {
        reply: Sender<Result<()>>,
    },
    Subscribe {
        conn: ConnId,
        sender: Sender<DeviceEvent>,
        reply: Sender<Result<()>>,
    },
    ConnectionClosed {
        conn: ConnId,
    },
    AuthDecided {
        seq: u64,
        decision: AuthDecision,
    },
    Scan {
        event: DeviceEvent,
    },
    Shutdown,
}

enum GatedOp {
    Verify { conn: ConnId, finger_hint: String },
    Enroll { conn: ConnId, finger_label: String },
    Delete { user: String },
}

struct PendingGated {
    op: GatedOp,
    reply: Sender<Result<()>>,
}

struct ScanHandle {
    cancel: Arc<AtomicBool>,
    done_rx: Receiver<()>,
    join: Option<JoinHandle<()>>,
}

impl ScanHandle {
    /// Ask the loop to stop and wait within the join budget. A loop that
    /// overruns is detached with a warning so the new operation can proceed.
    fn stop(mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        match self.done_rx.recv_timeout(SCAN_JOIN_BUDGET) {
            Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(join) = self.join.take() {
                    let _ = join.join();
                }
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!("scan loop did not stop within the join budget, detaching");
            }
        }
    }
}

/// One logical sensor device: a scheduler thread owning all session state,
/// plus at most one scan-loop worker at a time. Clients interact through a
/// cloned `DeviceHandle`; the scheduler never blocks on the sensor or on
/// the authorization oracle.
pub struct Device {
    handle: DeviceHandle,
    scheduler: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct DeviceHandle {
    tx: Sender<Command>,
}

impl Device {
    pub fn spawn(
        engine: Arc<MatchEngine>,
        source: Arc<dyn FrameSource>,
        authority: Arc<dyn Authority>,
        config: Config,
    ) -> Self {
        let (tx, rx) = channel();
        let scheduler_tx = tx.clone();
        let scheduler = std::thread::spawn(move || {
            Scheduler::new(engine, source, authority, config, scheduler_tx).run(rx);
        });
        Self {
            handle: DeviceHandle { tx },
            scheduler: Some(scheduler),
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle.clone()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if let Some(join) = self.scheduler.take() {
            let _ = join.join();
        }
    }
}

impl DeviceHandle {
    fn call<T>(&self, build: impl FnOnce(Sender<Result<T>>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| RidgelineError::DeviceGone)?;
        reply_rx.recv().map_err(|_| RidgelineError::DeviceGone)?
    }

    pub fn claim(&self, identity: &str, conn: ConnId) -> Result<()> {
        self.call(|reply| Command::Claim {
            identity: identity.to_string(),
            conn,
            reply,
        })
    }

    pub fn release(&self, conn: ConnId) -> Result<()> {
        self.call(|reply| Command::Release { conn, reply })
    }

    /// Start the verify loop. Returns once the authorization oracle has
    /// answered; match results arrive as `DeviceEvent`s.
    pub fn verify_start(&self, conn: ConnId, finger_hint: &str) -> Result<()> {
        self.call(|reply| Command::VerifyStart {
            conn,
            finger_hint: finger_hint.to_string(),
            reply,
        })
    }

    pub fn enroll_start(&self, conn: ConnId, finger_label: &str) -> Result<()> {
        self.call(|reply| Command::EnrollStart {
            conn,
            finger_label: finger_label.to_string(),
            reply,
        })
    }

    pub fn cancel(&self, conn: ConnId) -> Result<()> {
        self.call(|reply| Command::Cancel { conn, reply })
    }

    pub fn verify_stop(&self, conn: ConnId) -> Result<()> {
        self.cancel(conn)
    }

    pub fn enroll_stop(&self, conn: ConnId) -> Result<()> {
        self.cancel(conn)
    }

    pub fn list_fingers(&self, user: &str) -> Result<Vec<String>> {
        self.call(|reply| Command::ListFingers {
            user: user.to_string(),
            reply,
        })
    }

    /// Delete every finger of `user`. Gated by the authorization oracle.
    pub fn delete_fingers(&self, requester: &str, user: &str) -> Result<()> {
        self.call(|reply| Command::DeleteFingers {
            requester: requester.to_string(),
            user: user.to_string(),
            reply,
        })
    }

    pub fn suspend(&self) -> Result<()> {
        self.call(|reply| Command::Suspend { reply })
    }

    pub fn resume(&self) -> Result<()> {
        self.call(|reply| Command::Resume { reply })
    }

    /// Register an event listener for `conn`. Events only flow while the
    /// connection holds the claim.
    pub fn subscribe(&self, conn: ConnId) -> Result<Receiver<DeviceEvent>> {
        let (event_tx, event_rx) = channel();
        self.call(|reply| Command::Subscribe {
            conn,
            sender: event_tx,
            reply,
        })?;
        Ok(event_rx)
    }

    /// Disconnect notification from the transport; auto-releases any claim
    /// held by `conn`. Never blocks, never fails on a dead device.
    pub fn connection_closed(&self, conn: ConnId) {
        let _ = self.tx.send(Command::ConnectionClosed { conn });
    }
}

struct Scheduler {
    engine: Arc<MatchEngine>,
    source: Arc<dyn FrameSource>,
    authority: Arc<dyn Authority>,
    config: Config,
    tx: Sender<Command>,
    session: SessionState,
    subscribers: HashMap<ConnId, Vec<Sender<DeviceEvent>>>,
    pending_auth: HashMap<u64, PendingGated>,
    queued: VecDeque<Command>,
    scan: Option<ScanHandle>,
    next_seq: u64,
}

impl Scheduler {
    fn new(
        engine: Arc<MatchEngine>,
        source: Arc<dyn FrameSource>,
        authority: Arc<dyn Authority>,
        config: Config,
        tx: Sender<Command>,
    ) -> Self {
        Self {
            engine,
            source,
            authority,
            config,
            tx,
            session: SessionState::new(),
            subscribers: HashMap::new(),
            pending_auth: HashMap::new(),
            queued: VecDeque::new(),
            scan: None,
            next_seq: 0,
        }
    }

    fn run(mut self, rx: Receiver<Command>) {
        while let Ok(command) = rx.recv() {
            if matches!(command, Command::Shutdown) {
                break;
            }
            self.dispatch(command);
        }
        self.stop_scan();
    }

    fn dispatch(&mut self, command: Command) {
        // Suspended devices defer operation requests; session bookkeeping
        // (claim, release, disconnects, resume) still runs immediately.
        if self.session.is_suspended() && Self::is_deferrable(&command) {
            tracing::debug!("device suspended, queueing request");
            self.queued.push_back(command);
            return;
        }

        match command {
            Command::Claim {
                identity,
                conn,
                reply,
            } => {
                let result = self.session.claim(&identity, conn);
                if result.is_ok() {
                    tracing::info!(%identity, "device claimed");
                }
                let _ = reply.send(result);
            }
            Command::Release { conn, reply } => {
                let result = self.session.release(conn).map(|owner| {
                    tracing::info!(identity = %owner.identity, "device released");
                });
                if result.is_ok() {
                    self.after_release(conn);
                }
                let _ = reply.send(result);
            }
            Command::ConnectionClosed { conn } => {
                if self
                    .session
                    .owner()
                    .is_some_and(|owner| owner.conn == conn)
                {
                    let owner = self.session.force_release();
                    tracing::info!(
                        identity = %owner.expect("owner checked above").identity,
                        "claim owner disconnected, auto-releasing"
                    );
                    self.after_release(conn);
                }
                self.subscribers.remove(&conn);
            }
            Command::VerifyStart {
                conn,
                finger_hint,
                reply,
            } => {
                let identity = match self.session.require_claim(conn) {
                    Ok(owner) => owner.identity.clone(),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                self.gate(
                    identity,
                    ACTION_VERIFY,
                    GatedOp::Verify { conn, finger_hint },
                    reply,
                );
            }
            Command::EnrollStart {
                conn,
                finger_label,
                reply,
            } => {
                let identity = match self.session.require_claim(conn) {
                    Ok(owner) => owner.identity.clone(),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                self.gate(
                    identity,
                    ACTION_ENROLL,
                    GatedOp::Enroll { conn, finger_label },
                    reply,
                );
            }
            Command::Cancel { conn, reply } => {
                let result = self.session.require_claim(conn).map(|_| ());
                if result.is_ok() {
                    self.stop_scan();
                    self.session.set_busy(false);
                }
                let _ = reply.send(result);
            }
            Command::ListFingers { user, reply } => {
                let _ = reply.send(self.engine.list_fingers(&user));
            }
            Command::DeleteFingers {
                requester,
                user,
                reply,
            } => {
                self.gate(requester, ACTION_ENROLL, GatedOp::Delete { user }, reply);
            }
            Command::Suspend { reply } => {
                self.session.set_suspended(true);
                tracing::info!("device suspended");
                let _ = reply.send(Ok(()));
            }
            Command::Resume { reply } => {
                self.session.set_suspended(false);
                tracing::info!("device resumed, draining {} request(s)", self.queued.len());
                let _ = reply.send(Ok(()));
                let queued: Vec<Command> = self.queued.drain(..).collect();
                for command in queued {
                    self.dispatch(command);
                }
            }
            Command::Subscribe {
                conn,
                sender,
                reply,
            } => {
                self.subscribers.entry(conn).or_default().push(sender);
                let _ = reply.send(Ok(()));
            }
            Command::AuthDecided { seq, decision } => {
                self.finish_gated(seq, decision);
            }
            Command::Scan { event } => {
                if event.is_done() {
                    self.session.set_busy(false);
                }
                self.emit(event);
            }
            Command::Shutdown => unreachable!("handled in run"),
        }
    }

    fn is_deferrable(command: &Command) -> bool {
        matches!(
            command,
            Command::VerifyStart { .. }
                | Command::EnrollStart { .. }
                | Command::Cancel { .. }
                | Command::ListFingers { .. }
                | Command::DeleteFingers { .. }
        )
    }

    /// Ship a privileged request to the authorization oracle without
    /// blocking the scheduler; the decision comes back as a command.
    fn gate(
        &mut self,
        identity: String,
        action_id: &'static str,
        op: GatedOp,
        reply: Sender<Result<()>>,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending_auth.insert(seq, PendingGated { op, reply });

        let tx = self.tx.clone();
        spawn_check(
            self.authority.clone(),
            identity,
            action_id,
            Duration::from_secs(self.config.authority.timeout_secs),
            move |decision| {
                let _ = tx.send(Command::AuthDecided { seq, decision });
            },
        );
    }

    fn finish_gated(&mut self, seq: u64, decision: AuthDecision) {
        let Some(PendingGated { op, reply }) = self.pending_auth.remove(&seq) else {
            tracing::debug!(seq, "dropping stale authorization decision");
            return;
        };
        if !decision.is_authorized() {
            tracing::info!(?decision, "privileged operation refused");
            let _ = reply.send(Err(RidgelineError::PermissionDenied));
            return;
        }

        match op {
            GatedOp::Verify { conn, finger_hint } => {
                let result = self.start_verify(conn, &finger_hint);
                let _ = reply.send(result);
            }
            GatedOp::Enroll { conn, finger_label } => {
                let result = self.start_enroll(conn, &finger_label);
                let _ = reply.send(result);
            }
            GatedOp::Delete { user } => {
                let result = self.engine.delete_user(&user).map(|removed| {
                    tracing::info!(%user, removed, "deleted enrolled fingers");
                });
                let _ = reply.send(result);
            }
        }
    }

    fn start_verify(&mut self, conn: ConnId, finger_hint: &str) -> Result<()> {
        let owner = self.session.require_claim(conn)?;
        let user = owner.identity.clone();
        if !finger_hint.is_empty() {
            tracing::debug!(finger_hint, "verify hint noted");
        }

        self.stop_scan();
        self.session.set_busy(true);

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = channel();
        let engine = self.engine.clone();
        let source = self.source.clone();
        let config = self.config.clone();
        let events = self.tx.clone();
        let cancel_flag = cancel.clone();

        let join = std::thread::spawn(move || {
            run_verify_loop(engine, source, config, user, cancel_flag, events);
            let _ = done_tx.send(());
        });
        self.scan = Some(ScanHandle {
            cancel,
            done_rx,
            join: Some(join),
        });
        Ok(())
    }

    fn start_enroll(&mut self, conn: ConnId, finger_label: &str) -> Result<()> {
        let owner = self.session.require_claim(conn)?;
        let subject_id = format!("{}_{}", owner.identity, finger_label);

        self.stop_scan();
        self.session.set_busy(true);

        let cancel = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = channel();
        let engine = self.engine.clone();
        let source = self.source.clone();
        let config = self.config.clone();
        let events = self.tx.clone();
        let cancel_flag = cancel.clone();

        let join = std::thread::spawn(move || {
            run_enroll_loop(engine, source, config, subject_id, cancel_flag, events);
            let _ = done_tx.send(());
        });
        self.scan = Some(ScanHandle {
            cancel,
            done_rx,
            join: Some(join),
        });
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.stop();
        }
    }

    fn after_release(&mut self, conn: ConnId) {
        self.stop_scan();
        // Decisions still in flight for this connection are now stale.
        self.pending_auth.retain(|_, pending| {
            let stale = match &pending.op {
                GatedOp::Verify { conn: c, .. } | GatedOp::Enroll { conn: c, .. } => *c == conn,
                GatedOp::Delete { .. } => false,
            };
            if stale {
                let _ = pending.reply.send(Err(RidgelineError::ClaimRequired));
            }
            !stale
        });
    }

    /// Deliver to the current claim owner's subscribers only.
    fn emit(&mut self, event: DeviceEvent) {
        let Some(owner) = self.session.owner() else {
            tracing::debug!(?event, "dropping event, no claim owner");
            return;
        };
        if let Some(senders) = self.subscribers.get_mut(&owner.conn) {
            senders.retain(|sender| sender.send(event).is_ok());
        }
    }
}

/// Block until the sensor reports clear for `clear_polls` consecutive polls
/// after a settle delay. Prevents one long touch from counting as several.
fn wait_for_clear(source: &dyn FrameSource, config: &Config, cancel: &AtomicBool) {
    let poll = Duration::from_millis(config.sensor.poll_interval_ms);
    std::thread::sleep(Duration::from_millis(config.enroll.settle_delay_ms));

    let mut consecutive = 0u32;
    while !cancel.load(Ordering::SeqCst) {
        match source.is_clear() {
            Ok(true) => {
                consecutive += 1;
                if consecutive >= config.enroll.clear_polls {
                    return;
                }
            }
            Ok(false) => consecutive = 0,
            Err(e) => {
                tracing::warn!("sensor clear poll failed: {}", e);
                consecutive = 0;
            }
        }
        std::thread::sleep(poll);
    }
}

fn run_verify_loop(
    engine: Arc<MatchEngine>,
    source: Arc<dyn FrameSource>,
    config: Config,
    user: String,
    cancel: Arc<AtomicBool>,
    events: Sender<Command>,
) {
    tracing::debug!(%user, "verify loop started");
    let poll = Duration::from_millis(config.sensor.poll_interval_ms);
    let capture_timeout = Duration::from_millis(config.sensor.capture_timeout_ms);

    wait_for_clear(source.as_ref(), &config, &cancel);

    while !cancel.load(Ordering::SeqCst) {
        match source.is_clear() {
            Ok(false) => {
                let frame = match source.capture_frame(capture_timeout) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => {
                        std::thread::sleep(poll);
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("capture failed: {}", e);
                        std::thread::sleep(poll);
                        continue;
                    }
                };

                match engine.verify(&frame) {
                    Ok((Some(subject), score)) if subject_in_namespace(&subject, &user) => {
                        tracing::info!(%subject, score, "verify match");
                        let _ = events.send(Command::Scan {
                            event: DeviceEvent::VerifyStatus {
                                result: VerifyResult::Match,
                                done: true,
                            },
                        });
                        return;
                    }
                    Ok((matched, score)) => {
                        if let Some(other) = matched {
                            tracing::debug!(%other, score, "matched outside requester namespace");
                        }
                        let _ = events.send(Command::Scan {
                            event: DeviceEvent::VerifyStatus {
                                result: VerifyResult::NoMatch,
                                done: false,
                            },
                        });
                    }
                    Err(e) => tracing::warn!("verify failed: {}", e),
                }

                wait_for_clear(source.as_ref(), &config, &cancel);
            }
            Ok(true) => {}
            Err(e) => tracing::warn!("sensor poll failed: {}", e),
        }
        std::thread::sleep(poll);
    }
    tracing::debug!("verify loop cancelled");
}

fn run_enroll_loop(
    engine: Arc<MatchEngine>,
    source: Arc<dyn FrameSource>,
    config: Config,
    subject_id: String,
    cancel: Arc<AtomicBool>,
    events: Sender<Command>,
) {
    tracing::debug!(%subject_id, "enroll loop started");
    let poll = Duration::from_millis(config.sensor.poll_interval_ms);
    let capture_timeout = Duration::from_millis(config.sensor.capture_timeout_ms);
    let stages = config.enroll.stages;
    let mut samples = Vec::with_capacity(stages);

    wait_for_clear(source.as_ref(), &config, &cancel);

    while !cancel.load(Ordering::SeqCst) && samples.len() < stages {
        match source.is_clear() {
            Ok(false) => {
                match source.capture_frame(capture_timeout) {
                    Ok(Some(frame)) => {
                        samples.push(frame);
                        tracing::info!("enroll stage {}/{}", samples.len(), stages);
                        if samples.len() < stages {
                            let _ = events.send(Command::Scan {
                                event: DeviceEvent::EnrollStatus {
                                    result: EnrollResult::StagePassed,
                                    done: false,
                                },
                            });
                            wait_for_clear(source.as_ref(), &config, &cancel);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("capture failed: {}", e),
                }
            }
            Ok(true) => {}
            Err(e) => tracing::warn!("sensor poll failed: {}", e),
        }
        std::thread::sleep(poll);
    }

    if cancel.load(Ordering::SeqCst) {
        tracing::debug!("enroll loop cancelled");
        return;
    }

    let result = match engine.enroll(&subject_id, &samples) {
        Ok(true) => EnrollResult::Completed,
        Ok(false) => EnrollResult::Failed,
        Err(e) => {
            tracing::error!("enrollment failed: {}", e);
            EnrollResult::Failed
        }
    };
    let _ = events.send(Command::Scan {
        event: DeviceEvent::EnrollStatus {
            result,
            done: true,
        },
    });
}
