//! Default configuration constants for streamscribe.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and provides a good balance
/// between quality and computational efficiency for voice applications.
pub const SAMPLE_RATE: u32 = 16_000;

/// Bytes per PCM sample (16-bit signed little-endian, mono).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Mixing tick interval in milliseconds.
///
/// 20ms is the cadence conferencing stacks deliver participant audio at;
/// the mixer consumes exactly one frame per participant per tick.
pub const MIX_FRAME_MS: u64 = 20;

/// Samples per mixing frame (20ms at 16kHz).
pub const MIX_FRAME_SAMPLES: usize = 320;

/// Per-participant ring capacity in frames (~200ms of audio).
///
/// Absorbs jitter between the conferencing collaborator's delivery and the
/// mixing tick; oldest frames are dropped when a participant overruns it.
pub const PARTICIPANT_RING_FRAMES: usize = 10;

/// Minimum RMS energy for a participant to count as actively speaking.
///
/// RMS is computed over one 20ms frame of raw 16-bit samples. Tuned for
/// conference audio where participant streams arrive pre-leveled.
pub const SPEECH_ENERGY_THRESHOLD: f64 = 500.0;

/// Grace period in milliseconds during which a segment's speaker
/// attribution may still be corrected by a late speaker-change event.
pub const SPEAKER_GRACE_PERIOD_MS: u64 = 200;

/// Minimum audio duration in milliseconds accumulated in the ring buffer
/// before a chunk is handed to the recognition backend.
pub const MIN_BUFFER_DURATION_MS: u64 = 1_000;

/// Circular ingestion buffer capacity in milliseconds of audio.
///
/// 30s at 16kHz/16-bit is 960kB per channel. Under sustained overflow the
/// oldest audio is overwritten — recency wins over completeness.
pub const RING_CAPACITY_MS: u64 = 30_000;

/// Default port scan ranges per transport.
pub const SRT_PORT_RANGE: (u16, u16) = (9000, 9100);
pub const RTMP_PORT_RANGE: (u16, u16) = (1935, 2035);
pub const WEBSOCKET_PORT_RANGE: (u16, u16) = (8100, 8200);

/// Upper bound for the randomized settle delay before port probing, in
/// milliseconds. Concurrent workers jitter their scans to avoid racing
/// for the same port.
pub const PORT_SETTLE_JITTER_MS: u64 = 50;

/// Consecutive decode pipeline failures tolerated before a worker reports
/// an unrecoverable error and stops restarting itself.
pub const WORKER_RETRY_CEILING: u32 = 3;

/// Times the orchestrator will respawn a crashed worker process before
/// marking the channel failed.
pub const WORKER_RESPAWN_CEILING: u32 = 3;

/// Grace window in milliseconds to wait for a terminated worker process
/// to exit before it is force-killed.
pub const WORKER_KILL_GRACE_MS: u64 = 3_000;

/// Engine restarts attempted after a retriable recognition error before
/// the channel is marked failed. Trust failures are never retried.
pub const ENGINE_RESTART_CEILING: u32 = 1;

/// Default recognition provider name.
pub const DEFAULT_PROVIDER: &str = "mock";

/// Default language code for transcription.
///
/// A single configured language fixes recognition to that language; more
/// than one enables continuous language identification in the backend.
pub const DEFAULT_LANGUAGE: &str = "en";

/// Default external decoder command. `{uri}` is substituted with the
/// transport URI; raw s16le mono 16kHz PCM is read from its stdout.
pub const DECODER_COMMAND: &str =
    "ffmpeg -hide_banner -loglevel error -i {uri} -f s16le -acodec pcm_s16le -ac 1 -ar 16000 -";

/// Converts a duration in milliseconds to a PCM byte count at the
/// configured sample rate and width.
pub fn ms_to_bytes(ms: u64, sample_rate: u32) -> usize {
    (ms as usize * sample_rate as usize * BYTES_PER_SAMPLE) / 1000
}
