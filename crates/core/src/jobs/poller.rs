use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::jobs::backend::JobStatusResponse;
use crate::media::FramePosition;
use crate::session::{ChildFrame, CompletedEdge, StoryboardSession};
use crate::types::JobStatus;

/// HTTP statuses a status poll may return and still be interpreted.
pub const ACCEPTED_HTTP_STATUSES: [u16; 2] = [200, 202];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    Done,
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    HttpStatus(u16),
    EdgeRemoved,
    Transport(String),
    JobFailed,
    Cancelled,
    TimedOut,
}

/// What one status response means for the loop.
#[derive(Debug)]
enum PollStep {
    Continue,
    Done { effects: Option<JoinHandle<()>> },
    Abandon(AbandonReason),
}

#[derive(Debug)]
pub struct PollOutcome {
    pub edge_id: String,
    pub job_id: String,
    pub state: PollState,
    pub reason: Option<AbandonReason>,
    pub ticks: u32,
    pub elapsed_writes: u32,
    /// Completion side effects, if this loop was the one that completed
    /// the job. Awaiting it is optional.
    pub effects: Option<JoinHandle<()>>,
}

/// Per-job state carried between ticks of one loop.
#[derive(Debug)]
struct LoopState {
    state: PollState,
    ticks: u32,
    last_elapsed: Option<u64>,
    elapsed_writes: u32,
}

impl LoopState {
    fn new() -> Self {
        Self {
            state: PollState::Idle,
            ticks: 0,
            last_elapsed: None,
            elapsed_writes: 0,
        }
    }
}

/// Drives one polling loop per pending job. Loops share the session's
/// registry, so overlapping loops for one id complete it at most once.
#[derive(Clone)]
pub struct JobPoller {
    session: StoryboardSession,
    interval: Duration,
    max_duration: Option<Duration>,
}

impl JobPoller {
    pub fn new(session: StoryboardSession, interval: Duration) -> Self {
        Self {
            session,
            interval: interval.max(Duration::from_millis(1)),
            max_duration: None,
        }
    }

    pub fn from_config(session: StoryboardSession, config: &BackendConfig) -> Self {
        Self::new(session, config.poll_interval()).with_max_duration(config.max_poll_duration())
    }

    /// Optional ceiling; jobs still pending after it are abandoned.
    pub fn with_max_duration(mut self, max_duration: Option<Duration>) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn session(&self) -> &StoryboardSession {
        &self.session
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawns a loop for `job_id` unless it is already polled, completed, or
    /// was abandoned.
    pub fn start(&self, edge_id: &str, job_id: &str) -> Option<JoinHandle<PollOutcome>> {
        let token = self.session.registry().register(job_id)?;
        let poller = self.clone();
        let edge_id = edge_id.to_string();
        let job_id = job_id.to_string();
        info!(job_id = %job_id, edge_id = %edge_id, "Polling job");
        Some(tokio::spawn(async move {
            poller.run(edge_id, job_id, token).await
        }))
    }

    /// Starts a loop for every pending arrow on the canvas.
    pub fn watch_pending(&self) -> Vec<JoinHandle<PollOutcome>> {
        self.session
            .pending_jobs()
            .into_iter()
            .filter_map(|(edge_id, job_id)| self.start(&edge_id, &job_id))
            .collect()
    }

    /// Submits a clip continuing from `parent_id` and starts polling it.
    pub async fn submit(
        &self,
        parent_id: &str,
        prompt: &str,
    ) -> anyhow::Result<(ChildFrame, Option<JoinHandle<PollOutcome>>)> {
        let (child, job_id) = self.session.submit_clip(parent_id, prompt).await?;
        let handle = self.start(&child.edge_id, &job_id);
        Ok((child, handle))
    }

    /// Stops every running loop. Completed jobs stay completed.
    pub fn shutdown(&self) {
        self.session.registry().unregister_all();
    }

    async fn run(&self, edge_id: String, job_id: String, token: CancellationToken) -> PollOutcome {
        let started = Instant::now();
        let mut ticker = interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut state = LoopState::new();
        state.state = PollState::Polling;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    return self.cancelled_outcome(edge_id, job_id, state);
                }
                _ = ticker.tick() => {}
            }
            state.ticks += 1;

            if !self.session.edge_exists(&edge_id) {
                return self.abandon(edge_id, job_id, state, AbandonReason::EdgeRemoved);
            }
            if self
                .max_duration
                .is_some_and(|ceiling| started.elapsed() >= ceiling)
            {
                return self.abandon(edge_id, job_id, state, AbandonReason::TimedOut);
            }

            let response = tokio::select! {
                _ = token.cancelled() => {
                    return self.cancelled_outcome(edge_id, job_id, state);
                }
                response = self.session.backend().job_status(&job_id) => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(error) => {
                    let reason = AbandonReason::Transport(format!("{error:#}"));
                    return self.abandon(edge_id, job_id, state, reason);
                }
            };

            let elapsed = started.elapsed();
            match self.apply_response(&edge_id, &job_id, &response, elapsed, &mut state) {
                PollStep::Continue => {}
                PollStep::Done { effects } => {
                    state.state = PollState::Done;
                    info!(job_id = %job_id, ticks = state.ticks, "Job completed");
                    return PollOutcome {
                        edge_id,
                        job_id,
                        state: state.state,
                        reason: None,
                        ticks: state.ticks,
                        elapsed_writes: state.elapsed_writes,
                        effects,
                    };
                }
                PollStep::Abandon(reason) => {
                    return self.abandon(edge_id, job_id, state, reason);
                }
            }
        }
    }

    /// Interprets one status response. Runs synchronously so the edge
    /// check and the canvas write cannot interleave with other mutations.
    fn apply_response(
        &self,
        edge_id: &str,
        job_id: &str,
        response: &JobStatusResponse,
        elapsed: Duration,
        state: &mut LoopState,
    ) -> PollStep {
        if !ACCEPTED_HTTP_STATUSES.contains(&response.http_status) {
            return PollStep::Abandon(AbandonReason::HttpStatus(response.http_status));
        }
        if !self.session.edge_exists(edge_id) {
            return PollStep::Abandon(AbandonReason::EdgeRemoved);
        }

        let Some(body) = response.body.as_ref() else {
            debug!(job_id, "Status response had no readable body");
            return PollStep::Continue;
        };

        match JobStatus::parse_lenient(&body.status) {
            JobStatus::Pending => {
                let seconds = elapsed.as_secs();
                if state.last_elapsed != Some(seconds) {
                    state.last_elapsed = Some(seconds);
                    if self.session.set_elapsed_seconds(edge_id, seconds) {
                        state.elapsed_writes += 1;
                    }
                }
                PollStep::Continue
            }
            JobStatus::Error => {
                self.session.mark_edge_failed(edge_id);
                PollStep::Abandon(AbandonReason::JobFailed)
            }
            JobStatus::Done => match body.video_url.as_deref().map(str::trim) {
                Some(video_url) if !video_url.is_empty() => PollStep::Done {
                    effects: self.complete(edge_id, job_id, video_url),
                },
                _ => {
                    debug!(job_id, "Job reported done without a video URL");
                    PollStep::Continue
                }
            },
        }
    }

    /// Completion handler. The first call per job marks it completed,
    /// writes the result onto the edge and spawns the follow-on pipeline;
    /// every later call is a no-op and returns `None`.
    pub fn complete(
        &self,
        edge_id: &str,
        job_id: &str,
        video_url: &str,
    ) -> Option<JoinHandle<()>> {
        if !self.session.registry().mark_completed(job_id) {
            debug!(job_id, "Job already completed; skipping side effects");
            return None;
        }

        let Some(completed) = self.session.complete_edge(edge_id, video_url) else {
            debug!(job_id, edge_id, "Edge vanished before completion was written");
            return None;
        };

        let session = self.session.clone();
        let video_url = video_url.to_string();
        Some(tokio::spawn(async move {
            let CompletedEdge {
                edge_id,
                downstream_frame,
            } = completed;
            run_completion_effects(session, edge_id, downstream_frame, video_url).await;
        }))
    }

    fn abandon(
        &self,
        edge_id: String,
        job_id: String,
        mut state: LoopState,
        reason: AbandonReason,
    ) -> PollOutcome {
        self.session.registry().abandon(&job_id);
        state.state = PollState::Abandoned;
        match &reason {
            AbandonReason::Transport(error) => {
                warn!(job_id = %job_id, %error, "Job poll failed; giving up")
            }
            other => info!(job_id = %job_id, reason = ?other, "Stopped polling job"),
        }

        PollOutcome {
            edge_id,
            job_id,
            state: state.state,
            reason: Some(reason),
            ticks: state.ticks,
            elapsed_writes: state.elapsed_writes,
            effects: None,
        }
    }

    fn cancelled_outcome(&self, edge_id: String, job_id: String, state: LoopState) -> PollOutcome {
        let completed = self.session.registry().is_completed(&job_id);
        debug!(job_id = %job_id, completed, "Poll loop cancelled");
        PollOutcome {
            edge_id,
            job_id,
            state: if completed {
                PollState::Done
            } else {
                PollState::Abandoned
            },
            reason: (!completed).then_some(AbandonReason::Cancelled),
            ticks: state.ticks,
            elapsed_writes: state.elapsed_writes,
            effects: None,
        }
    }
}

/// Context extraction and the downstream thumbnail run side by side; each
/// is best-effort and cannot undo the completion.
async fn run_completion_effects(
    session: StoryboardSession,
    edge_id: String,
    downstream_frame: Option<String>,
    video_url: String,
) {
    let context = async {
        if let Err(error) = session.extract_context(&edge_id, &video_url).await {
            warn!(edge_id = %edge_id, "Context extraction failed: {error:#}");
        }
    };
    let thumbnail = async {
        let Some(frame_id) = downstream_frame.as_deref() else {
            return;
        };
        if let Err(error) = session
            .attach_frame_image(frame_id, &video_url, FramePosition::Last)
            .await
        {
            warn!(frame_id, "Last-frame extraction failed: {error:#}");
        }
    };

    tokio::join!(context, thumbnail);
}
