//! Alignment Sampler
//!
//! The lock-in streams the AC (fundamental), DC and LP (2nd harmonic) demodulators
//! independently, each sample stamped with the device clock. A data point needs the three
//! channels at the *same* instants, so the sampler:
//!
//! 1. subscribes to the three sample paths,
//! 2. polls in bounded slices, keeping a slice only if all three paths delivered data,
//! 3. after each poll intersects the timestamps seen on every channel,
//! 4. stops at the target count, on abort, or after a bounded number of polls,
//! 5. keeps the most recent `target_count` common timestamps and filters each channel
//!    to exactly that set.
//!
//! As the deficit drops below one poll's worth of samples the slice shrinks
//! proportionally (floored at `min_poll_s`) so the last poll does not overshoot.

use crate::cancel::AbortSignal;
use crate::config::LockinConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{DemodChunk, LockinApi};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

// Channel order of a frame; demodulator paths are subscribed in this order.
/// Fundamental
pub const AC: usize = 0;
/// 0 Hz reference
pub const DC: usize = 1;
/// Second harmonic
pub const LP: usize = 2;

/// One demodulator reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSample {
    /// Device clock ticks
    pub timestamp: u64,
    /// In-phase component in V
    pub x: f64,
    /// Quadrature component in V
    pub y: f64,
}

impl ChannelSample {
    /// Either component is NaN
    pub fn has_nan(&self) -> bool {
        self.x.is_nan() || self.y.is_nan()
    }
}

/// Samples of the AC, DC and LP channels sharing one ordered timestamp set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlignedFrame {
    channels: [Vec<ChannelSample>; 3],
}

impl AlignedFrame {
    /// Build a frame, rejecting channels whose timestamps differ.
    pub fn from_channels(channels: [Vec<ChannelSample>; 3]) -> AppResult<Self> {
        let reference: Vec<u64> = channels[AC].iter().map(|s| s.timestamp).collect();
        for channel in &channels[1..] {
            let same = channel.len() == reference.len()
                && channel
                    .iter()
                    .zip(&reference)
                    .all(|(s, t)| s.timestamp == *t);
            if !same {
                return Err(DaqError::InvalidState(
                    "channel timestamps of an aligned frame differ".to_string(),
                ));
            }
        }
        Ok(Self { channels })
    }

    /// Samples per channel
    pub fn len(&self) -> usize {
        self.channels[AC].len()
    }

    /// No aligned samples
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Channel by index ([`AC`], [`DC`] or [`LP`])
    pub fn channel(&self, index: usize) -> &[ChannelSample] {
        &self.channels[index]
    }

    /// Fundamental demodulator
    pub fn ac(&self) -> &[ChannelSample] {
        &self.channels[AC]
    }

    /// DC demodulator
    pub fn dc(&self) -> &[ChannelSample] {
        &self.channels[DC]
    }

    /// Second-harmonic demodulator
    pub fn lp(&self) -> &[ChannelSample] {
        &self.channels[LP]
    }

    /// The shared timestamp set
    pub fn timestamps(&self) -> Vec<u64> {
        self.channels[AC].iter().map(|s| s.timestamp).collect()
    }

    /// Copy without the indices where any channel holds a NaN component.
    pub fn without_nan(&self) -> Self {
        let keep: Vec<bool> = (0..self.len())
            .map(|i| self.channels.iter().all(|c| !c[i].has_nan()))
            .collect();
        let filter = |c: &Vec<ChannelSample>| -> Vec<ChannelSample> {
            c.iter()
                .zip(&keep)
                .filter(|(_, k)| **k)
                .map(|(s, _)| *s)
                .collect()
        };
        Self {
            channels: [
                filter(&self.channels[AC]),
                filter(&self.channels[DC]),
                filter(&self.channels[LP]),
            ],
        }
    }
}

/// Polling plan for one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerSettings {
    /// AC, DC and LP sample paths
    pub paths: [String; 3],
    /// Aligned samples wanted per channel
    pub target_count: usize,
    /// Demodulator transfer rate in Hz
    pub sampling_rate: f64,
    /// Length of the first poll slice
    pub initial_poll: Duration,
    /// Shortest poll slice
    pub min_poll: Duration,
    /// Poll bound before the sampler gives up
    pub max_polls: usize,
}

impl SamplerSettings {
    /// Plan for `target_count` samples at the configured transfer rate.
    ///
    /// The first slice is `min(max_poll_s, 1.3 · dwell_time)`; the poll bound is the
    /// nominal number of slices plus `poll_slack`.
    pub fn new(
        paths: [String; 3],
        dwell_time: f64,
        target_count: usize,
        config: &LockinConfig,
    ) -> Self {
        let initial = config.max_poll_s.min(1.3 * dwell_time).max(config.min_poll_s);
        let per_poll = (initial * config.sampling_rate).max(f64::MIN_POSITIVE);
        let nominal = (target_count as f64 / per_poll).ceil() as usize;
        Self {
            paths,
            target_count,
            sampling_rate: config.sampling_rate,
            initial_poll: Duration::from_secs_f64(initial),
            min_poll: Duration::from_secs_f64(config.min_poll_s),
            max_polls: nominal + config.poll_slack as usize,
        }
    }

    fn samples_per_poll(&self) -> f64 {
        self.initial_poll.as_secs_f64() * self.sampling_rate
    }
}

type RawChannel = BTreeMap<u64, (f64, f64)>;

fn append(raw: &mut RawChannel, chunk: &DemodChunk) {
    for i in 0..chunk.len() {
        raw.insert(chunk.timestamps[i], (chunk.x[i], chunk.y[i]));
    }
}

/// Ordered timestamps present in every channel.
fn common_timestamps(raw: &[RawChannel; 3]) -> Vec<u64> {
    raw[AC]
        .keys()
        .filter(|t| raw[DC].contains_key(t) && raw[LP].contains_key(t))
        .copied()
        .collect()
}

struct PollOutcome {
    raw: [RawChannel; 3],
    aligned: Vec<u64>,
    polls: usize,
}

async fn poll_until_aligned(
    api: &mut dyn LockinApi,
    settings: &SamplerSettings,
    abort: &AbortSignal,
) -> AppResult<PollOutcome> {
    let transport = |e: anyhow::Error| DaqError::Communication {
        device: "MFLI".to_string(),
        query: "poll".to_string(),
        attempts: 1,
        reason: format!("{:#}", e),
    };

    let mut raw: [RawChannel; 3] = Default::default();
    let mut aligned = Vec::new();
    let mut poll_time = settings.initial_poll;
    let per_poll = settings.samples_per_poll();
    let mut polls = 0;

    while aligned.len() < settings.target_count
        && !abort.is_requested()
        && polls < settings.max_polls
    {
        for path in &settings.paths {
            api.get_as_event(path).await.map_err(transport)?;
        }
        let chunk = api.poll(poll_time).await.map_err(transport)?;

        // All-or-nothing: a slice missing any channel contributes no data.
        let complete: Option<Vec<&DemodChunk>> =
            settings.paths.iter().map(|p| chunk.get(p)).collect();
        match complete {
            Some(parts) => {
                for (channel, part) in raw.iter_mut().zip(parts) {
                    append(channel, part);
                }
            }
            None => debug!(poll = polls, "incomplete poll slice discarded"),
        }

        aligned = common_timestamps(&raw);
        let deficit = settings.target_count.saturating_sub(aligned.len()) as f64;
        if deficit < per_poll {
            let shrunk = deficit / settings.sampling_rate * 1.2;
            poll_time = Duration::from_secs_f64(shrunk).max(settings.min_poll);
        }
        polls += 1;
    }

    Ok(PollOutcome {
        raw,
        aligned,
        polls,
    })
}

/// Collect one aligned frame.
///
/// Returns `Ok(None)` on abort or when no common timestamp was found. A frame shorter than
/// the target is returned with a warning. The subscriptions are always released.
pub async fn acquire_aligned(
    api: &mut dyn LockinApi,
    settings: &SamplerSettings,
    abort: &AbortSignal,
) -> AppResult<Option<AlignedFrame>> {
    let subscribe = async {
        for path in &settings.paths {
            api.subscribe(path).await?;
        }
        // Clears buffered data
        api.sync().await
    };
    if let Err(e) = subscribe.await {
        let _ = api.unsubscribe_all().await;
        return Err(DaqError::Instrument(format!("lock-in subscribe: {:#}", e)));
    }

    let outcome = poll_until_aligned(api, settings, abort).await;
    let released = api.unsubscribe_all().await;
    let outcome = outcome?;
    released.map_err(|e| DaqError::Instrument(format!("lock-in unsubscribe: {:#}", e)))?;

    if abort.is_requested() {
        debug!("acquisition aborted after {} polls", outcome.polls);
        return Ok(None);
    }

    let found = outcome.aligned.len();
    if found == 0 {
        warn!(polls = outcome.polls, "no aligned samples from lock-in");
        return Ok(None);
    }
    if found < settings.target_count {
        warn!(
            found,
            target = settings.target_count,
            "partial acquisition after {} polls",
            outcome.polls
        );
    }

    let keep = &outcome.aligned[found.saturating_sub(settings.target_count)..];
    let channels = outcome.raw.map(|channel| {
        keep.iter()
            .filter_map(|t| {
                channel.get(t).map(|&(x, y)| ChannelSample {
                    timestamp: *t,
                    x,
                    y,
                })
            })
            .collect::<Vec<_>>()
    });

    AlignedFrame::from_channels(channels).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockLockin;

    fn paths() -> [String; 3] {
        [
            "/dev3902/demods/0/sample".to_string(),
            "/dev3902/demods/2/sample".to_string(),
            "/dev3902/demods/3/sample".to_string(),
        ]
    }

    fn settings(target: usize) -> SamplerSettings {
        SamplerSettings::new(paths(), 0.5, target, &LockinConfig::default())
    }

    #[test]
    fn poll_plan_from_dwell_time() {
        let plan = settings(53);
        assert_eq!(plan.initial_poll, Duration::from_secs_f64(0.1));
        // 53 / 10.46 -> 6 nominal polls plus slack
        assert_eq!(plan.max_polls, 16);

        let short = SamplerSettings::new(paths(), 0.05, 6, &LockinConfig::default());
        assert!((short.initial_poll.as_secs_f64() - 0.065).abs() < 1e-9);
    }

    #[test]
    fn frame_rejects_misaligned_channels() {
        let a = vec![ChannelSample { timestamp: 1, x: 0.0, y: 1.0 }];
        let b = vec![ChannelSample { timestamp: 2, x: 0.0, y: 1.0 }];
        assert!(AlignedFrame::from_channels([a.clone(), a.clone(), b]).is_err());
        assert!(AlignedFrame::from_channels([a.clone(), a.clone(), a]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn collects_exact_target_count() {
        let mut lockin = MockLockin::new();
        let abort = AbortSignal::new();
        let frame = acquire_aligned(&mut lockin, &settings(53), &abort)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(frame.len(), 53);
        assert_eq!(frame.ac().len(), frame.dc().len());
        assert_eq!(frame.dc().len(), frame.lp().len());
        assert!(lockin.subscriptions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_samples_never_misalign_channels() {
        let mut lockin = MockLockin::new();
        lockin.drop_every(&paths()[1], 3).await;
        let abort = AbortSignal::new();
        let frame = acquire_aligned(&mut lockin, &settings(40), &abort)
            .await
            .unwrap()
            .unwrap();

        assert!(frame.len() <= 40);
        assert_eq!(frame.timestamps(), frame.dc().iter().map(|s| s.timestamp).collect::<Vec<_>>());
        assert_eq!(frame.timestamps(), frame.lp().iter().map(|s| s.timestamp).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_the_most_recent_samples() {
        let mut lockin = MockLockin::new();
        let abort = AbortSignal::new();
        let frame = acquire_aligned(&mut lockin, &settings(5), &abort)
            .await
            .unwrap()
            .unwrap();
        let ts = frame.timestamps();
        assert_eq!(ts.len(), 5);
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn slice_missing_a_channel_is_discarded() {
        let mut lockin = MockLockin::new();
        lockin.omit_from_polls(&paths()[2], 100).await;
        let abort = AbortSignal::new();
        let result = acquire_aligned(&mut lockin, &settings(20), &abort)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn abort_returns_none_and_unsubscribes() {
        let mut lockin = MockLockin::new();
        let abort = AbortSignal::new();
        abort.request("test");
        let result = acquire_aligned(&mut lockin, &settings(20), &abort)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(lockin.subscriptions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_is_a_communication_error() {
        let mut lockin = MockLockin::new();
        lockin.fail_acquisitions_from(1).await;
        let abort = AbortSignal::new();
        let result = acquire_aligned(&mut lockin, &settings(20), &abort).await;
        assert!(matches!(result, Err(DaqError::Communication { .. })));
        assert!(lockin.subscriptions().await.is_empty());
    }
}
