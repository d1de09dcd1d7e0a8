// Protocol constants for the KM200 gateway

use std::time::Duration;

/// User-Agent the gateway expects on every request
pub const USER_AGENT: &str = "TeleHeater/2.2.3";

/// AES block size of the wire envelope (bytes)
pub const BLOCK_SIZE: usize = 16;

/// The firmware blob, the only path whose body is not a JSON object
pub const FIRMWARE_PATH: &str = "/gateway/firmware";

/// Well-known capability roots, explored in this order
pub const WELL_KNOWN_ROOTS: [&str; 8] = [
    "/system",
    "/dhwCircuits",
    "/gateway",
    "/heatingCircuits",
    "/heatSources",
    "/notifications",
    "/recordings",
    "/solarCircuits",
];

/// Default number of additional attempts after a retryable failure
pub const DEFAULT_RETRIES: u32 = 3;

/// Disables retrying, every exchange makes exactly one attempt
pub const RETRY_DISABLED: u32 = 0;

/// Lower bound of the jittered retry backoff
pub const RETRY_DELAY_MIN: Duration = Duration::from_secs(1);

/// Upper bound of the jittered retry backoff
pub const RETRY_DELAY_MAX: Duration = Duration::from_secs(2);

/// Expansion depth cap, guards the explorer against cycles in the
/// capability graph
pub const MAX_TREE_DEPTH: usize = 16;
