//! Common job machinery: mailbox messages, the `Job` trait and the runner loop
//! that implements the reorg freeze/defer/replay discipline for every job.
use std::{
    collections::{HashMap, VecDeque},
    sync::Weak,
};

use async_trait::async_trait;
use bitcoin::{PublicKey, Transaction, Txid};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{
    error::SyncError,
    types::{ElementIndex, JobType, Position, StateSequence},
};

use super::context::SubchainContext;

/// Regular (deferrable) work for a job.
#[derive(Clone, Debug)]
pub(crate) enum Work {
    /// Run the state machine now.
    StateMachine,
    /// New keys to index.
    Key(Vec<(ElementIndex, PublicKey)>),
    /// Raw patterns to index as-is.
    Patterns(Vec<(ElementIndex, Vec<u8>)>),
    /// Re-test every block above this position.
    Rescan(Position),
    /// Positions whose filters matched.
    Dirty(Vec<Position>),
    /// Unconfirmed transaction to match.
    Mempool(Transaction),
    /// Transactions confirmed at a position outside the download pipeline.
    Confirmed(Position, Vec<Txid>),
    /// Watermarks moved.
    Update,
    /// The element set grew.
    NewElements,
}

/// Everything a job's mailbox carries.
#[derive(Debug)]
pub(crate) enum JobMessage {
    ReorgBegin(StateSequence, oneshot::Sender<()>),
    ProcessReorg(Position, oneshot::Sender<usize>),
    ReorgEnd(StateSequence, oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
    Work(Work),
}

/// Counts acknowledgements of a broadcast. More acks than expected means the
/// protocol is broken.
#[derive(Debug)]
pub(crate) struct AckCounter {
    expected: usize,
    received: usize,
}

impl AckCounter {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            received: 0,
        }
    }

    pub fn ack(&mut self) {
        self.received += 1;
        assert!(
            self.received <= self.expected,
            "received {} acknowledgements, expected {}",
            self.received,
            self.expected
        );
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected
    }
}

/// Mailboxes of a subchain's jobs.
pub(crate) struct JobRouter {
    senders: HashMap<JobType, mpsc::UnboundedSender<JobMessage>>,
}

impl JobRouter {
    /// Create a mailbox per job; the receivers go to the job runners.
    pub fn new() -> (Self, HashMap<JobType, mpsc::UnboundedReceiver<JobMessage>>) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for kind in JobType::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(kind, tx);
            receivers.insert(kind, rx);
        }
        (Self { senders }, receivers)
    }

    pub fn send(&self, kind: JobType, message: JobMessage) -> Result<(), SyncError> {
        self.senders
            .get(&kind)
            .ok_or(SyncError::JobUnavailable(kind))?
            .send(message)
            .map_err(|_| SyncError::JobUnavailable(kind))
    }

    /// Fire-and-forget work; a stopped job is only worth a debug line.
    pub fn notify(&self, kind: JobType, work: Work) {
        if let Err(e) = self.send(kind, JobMessage::Work(work)) {
            tracing::debug!(error = %e, "dropping notification");
        }
    }

    /// Send a request to every job and collect the replies in job order.
    pub async fn broadcast<T, F>(&self, make: F) -> Result<Vec<T>, SyncError>
    where
        F: Fn(oneshot::Sender<T>) -> JobMessage,
    {
        let mut waiting = Vec::with_capacity(JobType::ALL.len());
        for kind in JobType::ALL {
            let (tx, rx) = oneshot::channel();
            self.send(kind, make(tx))?;
            waiting.push((kind, rx));
        }
        let mut acks = AckCounter::new(waiting.len());
        let mut out = Vec::with_capacity(waiting.len());
        for (kind, rx) in waiting {
            out.push(rx.await.map_err(|_| SyncError::JobUnavailable(kind))?);
            acks.ack();
        }
        debug_assert!(acks.is_complete());
        Ok(out)
    }
}

/// One of the five cooperating jobs of a subchain.
#[async_trait]
pub(crate) trait Job: Send {
    fn kind(&self) -> JobType;

    /// Handle one piece of regular work.
    async fn work(&mut self, ctx: &SubchainContext, work: Work) -> anyhow::Result<()>;

    /// Advance; returns whether more work is pending right away.
    async fn state_machine(&mut self, ctx: &SubchainContext) -> anyhow::Result<bool>;

    /// Drop job-local state above `ancestor`; returns the number of errors.
    async fn process_reorg(&mut self, _ctx: &SubchainContext, _ancestor: Position) -> usize {
        0
    }

    async fn shutdown(&mut self, _ctx: &SubchainContext) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum JobState {
    Normal,
    Reorg,
}

async fn run_work<J: Job>(job: &mut J, ctx: &SubchainContext, work: Work) {
    if let Err(e) = job.work(ctx, work).await {
        tracing::warn!(subchain = %ctx.id, job = %job.kind(), "work failed: {e:#}");
    }
}

async fn run_state_machine<J: Job>(job: &mut J, ctx: &SubchainContext) -> bool {
    match job.state_machine(ctx).await {
        Ok(pending) => pending,
        Err(e) => {
            // retried on the next idle poll
            tracing::warn!(subchain = %ctx.id, job = %job.kind(), "state machine failed: {e:#}");
            false
        }
    }
}

/// Run `job` until its mailbox closes, the context goes away or it is told to
/// shut down.
///
/// While frozen for a reorg only reorg messages are handled; regular work is
/// queued and replayed in arrival order once the reorg ends.
pub(crate) fn spawn_job<J>(
    mut job: J,
    ctx: Weak<SubchainContext>,
    mut inbox: mpsc::UnboundedReceiver<JobMessage>,
) -> JoinHandle<()>
where
    J: Job + 'static,
{
    tokio::spawn(async move {
        let kind = job.kind();
        let Some((id, tick, poll)) = ctx
            .upgrade()
            .map(|c| (c.id, c.config.tick_interval, c.config.poll_interval))
        else {
            return;
        };
        let mut state = JobState::Normal;
        let mut deferred: VecDeque<Work> = VecDeque::new();
        let mut pending = true;
        let mut fast = time::interval(tick);
        fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut slow = time::interval(poll);
        slow.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(subchain = %id, job = %kind, "job started");

        loop {
            let normal = state == JobState::Normal;
            tokio::select! {
                message = inbox.recv() => {
                    let Some(message) = message else { break };
                    let Some(ctx) = ctx.upgrade() else { break };
                    ctx.activity.touch(kind);
                    match message {
                        JobMessage::ReorgBegin(reorg, ack) => {
                            state = JobState::Reorg;
                            tracing::debug!(subchain = %id, job = %kind, %reorg, "frozen for reorg");
                            let _ = ack.send(());
                        }
                        JobMessage::ProcessReorg(ancestor, ack) => {
                            let errors = if state == JobState::Reorg {
                                job.process_reorg(&ctx, ancestor).await
                            } else {
                                tracing::error!(subchain = %id, job = %kind, "reorg processing requested outside a reorg");
                                1
                            };
                            let _ = ack.send(errors);
                        }
                        JobMessage::ReorgEnd(reorg, ack) => {
                            state = JobState::Normal;
                            tracing::debug!(subchain = %id, job = %kind, %reorg, deferred = deferred.len(), "resuming after reorg");
                            let _ = ack.send(());
                            while let Some(work) = deferred.pop_front() {
                                run_work(&mut job, &ctx, work).await;
                            }
                            pending = true;
                        }
                        JobMessage::Shutdown(ack) => {
                            if !deferred.is_empty() {
                                tracing::debug!(subchain = %id, job = %kind, dropped = deferred.len(), "dropping deferred work");
                            }
                            job.shutdown(&ctx).await;
                            let _ = ack.send(());
                            break;
                        }
                        JobMessage::Work(work) => {
                            if state == JobState::Reorg {
                                deferred.push_back(work);
                            } else {
                                run_work(&mut job, &ctx, work).await;
                                pending = true;
                            }
                        }
                    }
                }
                _ = fast.tick(), if normal && pending => {
                    let Some(ctx) = ctx.upgrade() else { break };
                    ctx.activity.touch(kind);
                    pending = run_state_machine(&mut job, &ctx).await;
                }
                _ = slow.tick(), if normal => {
                    let Some(ctx) = ctx.upgrade() else { break };
                    ctx.activity.touch(kind);
                    pending = run_state_machine(&mut job, &ctx).await;
                }
            }
        }
        tracing::debug!(subchain = %id, job = %kind, "job stopped");
    })
}
