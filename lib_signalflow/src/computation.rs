//! # Computation
//!
//! The caller's view of one running SignalFlow job. A computation is built by
//! [`Client::execute`](crate::Client::execute) and driven by a watch loop that
//! consumes its channel:
//!
//! - job metadata (handle, resolution, lag, ...) starts out unknown and becomes
//!   known as info messages arrive. The accessors wait for a value up to the
//!   metadata timeout and yield an empty result when none shows up.
//! - data batches and TSID expirations are handed off through unbounded
//!   [`Relay`]s, so a slow reader never holds up the rest of the client.
//! - the computation ends exactly once: normally on end-of-channel or abort,
//!   with an error on a job error or when the connection drops under it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::core::{Channel, CloseReason, Registry};
use crate::error::ClientError;
use crate::messages::{
    DataMessage, DetachRequest, EventMessage, ExpiredTsidMessage, InfoContents, Message, MetadataMessage, StopRequest,
    Tsid,
};
use crate::options::OptionsError;
use crate::relay::Relay;

/// A job failure reported by SignalFlow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobError {
    pub code: i64,
    pub message: Option<String>,
    pub error_type: Option<String>,
}

impl JobError {
    /// Reads `error`, `message` and `errorType` out of an error message body.
    /// The code may arrive as an integer, a float or a numeric string.
    pub fn from_fields(raw: &Map<String, Value>) -> Self {
        let code = match raw.get("error") {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or_default(),
            Some(Value::String(s)) => s.trim().parse().unwrap_or_default(),
            _ => 0,
        };
        let text = |key: &str| raw.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string);

        Self {
            code,
            message: text("message"),
            error_type: text("errorType"),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(error_type) = &self.error_type {
            write!(f, " ({})", error_type)?;
        }
        if let Some(message) = &self.message {
            write!(f, ": {}", message)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

/// Why a computation ended abnormally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputationError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("connection lost before the computation finished")]
    ConnectionLost,
}

/// Job metadata as known so far. Every field only moves from unknown to known,
/// later values overwriting earlier ones.
#[derive(Debug, Default)]
struct State {
    handle: Option<String>,
    resolution: Option<Duration>,
    lag: Option<Duration>,
    max_delay: Option<Duration>,
    matched_size: Option<i64>,
    limit_size: Option<i64>,
    matched_no_timeseries_query: Option<String>,
    group_by_missing_properties: Option<Vec<String>>,
    tsid_metadata: HashMap<Tsid, Arc<MetadataMessage>>,
    events: Vec<EventMessage>,
    error: Option<ComputationError>,
}

impl State {
    fn apply_info(&mut self, contents: &InfoContents) {
        match contents {
            InfoContents::JobRunningResolution { resolution_ms } => self.resolution = Some(millis(*resolution_ms)),
            InfoContents::JobDetectedLag { lag_ms } => self.lag = Some(millis(*lag_ms)),
            InfoContents::JobInitialMaxDelay { max_delay_ms } => self.max_delay = Some(millis(*max_delay_ms)),
            InfoContents::FindLimitedResultSet { matched_size, limit_size } => {
                self.matched_size = Some(*matched_size);
                self.limit_size = Some(*limit_size);
            }
            InfoContents::FindMatchedNoTimeseries { query } => {
                self.matched_no_timeseries_query = Some(query.clone());
            }
            InfoContents::GroupByMissingProperty { property_names } => {
                self.group_by_missing_properties = Some(property_names.clone());
            }
            InfoContents::Other => {}
        }
    }
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(ms.max(0) as u64)
}

/// State shared between a computation handle and its watch loop.
struct Shared {
    name: String,
    state: Mutex<State>,
    version: watch::Sender<u64>,
    metadata_timeout: Mutex<Duration>,
    token: CancellationToken,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metadata_timeout(&self) -> Duration {
        *self.metadata_timeout.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wakes every task waiting on metadata.
    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Ends the computation. The first recorded error is kept.
    fn finish(&self, error: Option<ComputationError>) {
        if let Some(error) = error {
            let mut state = self.state();
            if state.error.is_none() {
                state.error = Some(error);
            }
        }
        self.token.cancel();
        self.notify();
    }

    fn process(
        &self,
        message: Message,
        data: &mpsc::UnboundedSender<DataMessage>,
        expirations: &mpsc::UnboundedSender<ExpiredTsidMessage>,
    ) {
        match message {
            Message::JobStart(start) => {
                log::debug!("Computation '{}' started with handle {}", self.name, start.handle);
                self.state().handle = Some(start.handle);
            }
            Message::EndOfChannel(_) => {
                log::debug!("Computation '{}' reached end of channel", self.name);
                self.finish(None);
            }
            Message::ChannelAbort(abort) => {
                log::info!("Computation '{}' aborted: {:?}", self.name, abort.abort_info);
                self.finish(None);
            }
            Message::Data(batch) => {
                // The reader may have gone away; data is then discarded.
                let _ = data.send(batch);
            }
            Message::ExpiredTsid(expired) => {
                self.state().tsid_metadata.remove(&expired.tsid);
                let _ = expirations.send(expired);
            }
            Message::Info(info) => self.state().apply_info(&info.contents),
            Message::Metadata(metadata) => {
                self.state().tsid_metadata.insert(metadata.tsid, Arc::new(metadata));
            }
            Message::Event(event) => self.state().events.push(event),
            Message::Error(error) => {
                let error = JobError::from_fields(&error.raw);
                log::warn!("Computation '{}' failed: {}", self.name, error);
                self.finish(Some(ComputationError::Job(error)));
            }
            other => log::trace!("Computation '{}' ignoring {} message", self.name, other.kind()),
        }
        self.notify();
    }
}

/// Handle to one running computation.
///
/// Dropping it stops local processing and releases the channel; the job keeps
/// running on the server until the connection closes. Use [`Self::stop`] to
/// end the job itself.
pub struct Computation {
    client: Client,
    shared: Arc<Shared>,
    data: Mutex<Option<Relay<DataMessage>>>,
    expirations: Mutex<Option<Relay<ExpiredTsidMessage>>>,
}

impl Computation {
    /// Starts the watch loop over `messages` and returns the caller's handle.
    pub(crate) fn start(
        client: Client,
        registry: Arc<Registry>,
        channel: Arc<Channel>,
        messages: mpsc::Receiver<Message>,
        parent: &CancellationToken,
        metadata_timeout: Duration,
    ) -> Self {
        let (version, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            name: channel.name().to_string(),
            state: Mutex::new(State::default()),
            version,
            metadata_timeout: Mutex::new(metadata_timeout),
            token: parent.child_token(),
        });
        let (data_tx, data) = Relay::channel();
        let (expired_tx, expirations) = Relay::channel();

        tokio::spawn(watch_loop(Arc::clone(&shared), registry, channel, messages, data_tx, expired_tx));

        Self {
            client,
            shared,
            data: Mutex::new(Some(data)),
            expirations: Mutex::new(Some(expirations)),
        }
    }

    /// Channel name the computation's messages are routed on.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Changes how long metadata accessors wait from now on.
    pub fn set_metadata_timeout(&self, metadata_timeout: Duration) -> Result<(), OptionsError> {
        if metadata_timeout.is_zero() {
            return Err(OptionsError::NonPositiveDuration("metadata timeout"));
        }
        *self.shared.metadata_timeout.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = metadata_timeout;
        Ok(())
    }

    /// Server-assigned job handle.
    pub async fn handle(&self) -> Option<String> {
        self.wait_for(|s| s.handle.clone()).await
    }

    pub async fn resolution(&self) -> Option<Duration> {
        self.wait_for(|s| s.resolution).await
    }

    pub async fn lag(&self) -> Option<Duration> {
        self.wait_for(|s| s.lag).await
    }

    pub async fn max_delay(&self) -> Option<Duration> {
        self.wait_for(|s| s.max_delay).await
    }

    /// Number of time series the program's filters matched.
    pub async fn matched_size(&self) -> Option<i64> {
        self.wait_for(|s| s.matched_size).await
    }

    /// Limit the matched set was cut down to.
    pub async fn limit_size(&self) -> Option<i64> {
        self.wait_for(|s| s.limit_size).await
    }

    /// Query that matched no time series at all.
    pub async fn matched_no_timeseries_query(&self) -> Option<String> {
        self.wait_for(|s| s.matched_no_timeseries_query.clone()).await
    }

    /// Group-by properties missing from some of the matched series.
    pub async fn group_by_missing_properties(&self) -> Vec<String> {
        self.wait_for(|s| s.group_by_missing_properties.clone()).await.unwrap_or_default()
    }

    /// Metadata of one time series, while that series is live.
    pub async fn tsid_metadata(&self, tsid: Tsid) -> Option<Arc<MetadataMessage>> {
        self.wait_for(|s| s.tsid_metadata.get(&tsid).cloned()).await
    }

    /// Events received so far, waiting for the first one if there are none yet.
    pub async fn events(&self) -> Vec<EventMessage> {
        self.wait_for(|s| (!s.events.is_empty()).then(|| s.events.clone())).await.unwrap_or_default()
    }

    /// Takes the data stream. Only the first call gets it.
    pub fn data(&self) -> Option<Relay<DataMessage>> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    /// Takes the stream of expired TSIDs. Only the first call gets it.
    pub fn expirations(&self) -> Option<Relay<ExpiredTsidMessage>> {
        self.expirations.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take()
    }

    /// Resolves once the computation has ended, for whatever reason.
    pub async fn done(&self) {
        self.shared.token.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// The error the computation ended with, if any.
    pub fn err(&self) -> Option<ComputationError> {
        self.shared.state().error.clone()
    }

    /// Asks SignalFlow to stop the job. Completion is observed through
    /// [`Self::done`] once the server closes the channel.
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.send_stop(None).await
    }

    pub async fn stop_with_reason(&self, reason: impl Into<String>) -> Result<(), ClientError> {
        self.send_stop(Some(reason.into())).await
    }

    /// Stops receiving the computation's messages without stopping the job.
    pub async fn detach(&self) -> Result<(), ClientError> {
        self.client.detach(DetachRequest::new(self.name())).await
    }

    async fn send_stop(&self, reason: Option<String>) -> Result<(), ClientError> {
        let handle = self.handle().await.ok_or_else(|| ClientError::HandleUnknown(self.name().to_string()))?;
        let mut request = StopRequest::new(handle);
        request.reason = reason;
        self.client.stop(request).await
    }

    /// Polls `read` against the current state, re-checking after every
    /// processed message, until it yields a value or the timeout elapses.
    /// Stops waiting early once the computation has ended.
    async fn wait_for<T>(&self, read: impl Fn(&State) -> Option<T>) -> Option<T> {
        let mut version = self.shared.version.subscribe();
        let wait = async {
            loop {
                version.borrow_and_update();
                let value = read(&self.shared.state());
                if value.is_some() {
                    return value;
                }
                if self.shared.token.is_cancelled() || version.changed().await.is_err() {
                    return None;
                }
            }
        };
        timeout(self.shared.metadata_timeout(), wait).await.ok().flatten()
    }
}

impl Drop for Computation {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

impl fmt::Debug for Computation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computation")
            .field("name", &self.shared.name)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Consumes one channel until the computation ends, then releases the channel.
async fn watch_loop(
    shared: Arc<Shared>,
    registry: Arc<Registry>,
    channel: Arc<Channel>,
    mut messages: mpsc::Receiver<Message>,
    data: mpsc::UnboundedSender<DataMessage>,
    expirations: mpsc::UnboundedSender<ExpiredTsidMessage>,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            message = messages.recv() => message,
        };

        match message {
            Some(message) => shared.process(message, &data, &expirations),
            None => {
                let error = match channel.close_reason() {
                    Some(CloseReason::Disconnected) => {
                        log::warn!("Computation '{}' lost its connection", shared.name);
                        Some(ComputationError::ConnectionLost)
                    }
                    _ => None,
                };
                shared.finish(error);
                break;
            }
        }
    }

    registry.unregister(&channel, CloseReason::Finished);
    log::debug!("Computation '{}' finished", shared.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error_fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn job_error_display() {
        let full = JobError::from_fields(&error_fields(json!({
            "error": 400, "message": "bad program", "errorType": "INVALID_QUERY"
        })));
        assert_eq!(full.to_string(), "400 (INVALID_QUERY): bad program");

        let code_only = JobError::from_fields(&error_fields(json!({ "error": "500" })));
        assert_eq!(code_only.to_string(), "500");

        let no_type = JobError::from_fields(&error_fields(json!({ "error": 401.0, "message": "denied" })));
        assert_eq!(no_type.to_string(), "401: denied");

        let wrapped = ComputationError::from(full);
        assert_eq!(wrapped.to_string(), "400 (INVALID_QUERY): bad program");
    }

    #[test]
    fn info_fields_only_move_forward() {
        let mut state = State::default();
        state.apply_info(&InfoContents::JobRunningResolution { resolution_ms: 10_000 });
        state.apply_info(&InfoContents::Other);
        assert_eq!(state.resolution, Some(Duration::from_secs(10)));

        state.apply_info(&InfoContents::JobRunningResolution { resolution_ms: 60_000 });
        state.apply_info(&InfoContents::FindLimitedResultSet { matched_size: 12, limit_size: 10 });
        assert_eq!(state.resolution, Some(Duration::from_secs(60)));
        assert_eq!((state.matched_size, state.limit_size), (Some(12), Some(10)));
        assert_eq!(state.lag, None);
    }

    #[test]
    fn negative_durations_clamp_to_zero() {
        assert_eq!(millis(-5), Duration::ZERO);
        assert_eq!(millis(1500), Duration::from_millis(1500));
    }
}
