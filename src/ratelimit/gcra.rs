//! Generic Cell Rate Algorithm.
//!
//! The whole persisted state of a key is its theoretical arrival time (TAT):
//! the earliest instant, in nanoseconds, at which the next request would
//! conform under ideal pacing. A request is admitted when advancing the TAT
//! by one emission period keeps it within `period * burst` of now.
//!
//! [`GCRA_SCRIPT`] evaluates this inside Redis; [`evaluate`] is the same
//! computation for stores that serialize per-key access themselves.

use std::time::Duration;

use super::backend::StoreError;

pub(crate) const NANOS_PER_SECOND: f64 = 1_000_000_000.0;
const NANOS_PER_MILLI: u128 = 1_000_000;

/// Atomic GCRA evaluation.
///
/// `KEYS[1]` is the store key, `ARGV` is `(burst, period_ns, now_ns)`.
/// Returns `0` when admitted, otherwise `-wait_ms` (always at least 1 ms).
///
/// Redis Lua numbers are doubles, which hold integers exactly only up to
/// 2^53. Epoch nanoseconds are far above that, so `now` and the stored TAT
/// are split into whole seconds and nanoseconds and the script only does
/// arithmetic on their difference. The TAT is stored as a plain integer
/// nanosecond string.
pub const GCRA_SCRIPT: &str = r#"
local function split(ns)
    local len = string.len(ns)
    if len <= 9 then
        return 0, tonumber(ns)
    end
    return tonumber(string.sub(ns, 1, len - 9)), tonumber(string.sub(ns, len - 8))
end

local key = KEYS[1]
local burst = tonumber(ARGV[1])
local period = tonumber(ARGV[2])
local now_s, now_n = split(ARGV[3])

local ahead = 0
local stored = redis.call("GET", key)
if stored and string.find(stored, "^%d+$") then
    local tat_s, tat_n = split(stored)
    ahead = math.max(0, (tat_s - now_s) * 1000000000 + (tat_n - now_n))
end

local horizon = ahead + period
local allowance = period * burst

if horizon > allowance then
    return -math.max(1, math.ceil((horizon - allowance) / 1000000))
end

local ttl_ms = math.max(1, math.ceil(math.max(horizon, period * 2) / 1000000))
local total = now_n + horizon
local new_n = math.fmod(total, 1000000000)
local new_s = now_s + (total - new_n) / 1000000000
redis.call("SET", key, string.format("%.0f%09.0f", new_s, new_n), "PX", ttl_ms)
return 0
"#;

/// Convert a sustained rate into the emission period in nanoseconds.
///
/// Rounded up so the enforced rate never exceeds the requested one.
/// Callers must reject non-positive rates before calling this.
pub fn period_nanos(rate_per_second: f64) -> u64 {
    // Float to int casts saturate, so tiny rates clamp to u64::MAX.
    ((NANOS_PER_SECOND / rate_per_second).ceil() as u64).max(1)
}

/// Outcome of one GCRA evaluation against a known TAT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Admit, storing `new_tat` for at least `ttl`.
    Admit { new_tat: u64, ttl: Duration },
    /// Reject; the caller must wait `wait_ms` before the request conforms.
    Reject { wait_ms: u64 },
}

impl Evaluation {
    /// Encode as the store protocol reply.
    pub fn to_reply(self) -> i64 {
        match self {
            Evaluation::Admit { .. } => 0,
            Evaluation::Reject { wait_ms } => -(wait_ms.min(i64::MAX as u64) as i64),
        }
    }
}

/// Evaluate a request against the stored TAT (`0` when the key is absent).
pub fn evaluate(tat: u64, burst: u32, period_ns: u64, now_ns: u64) -> Evaluation {
    let period = period_ns as u128;
    let now = now_ns as u128;
    let new_tat = tat.max(now_ns) as u128 + period;
    let horizon = new_tat - now;
    let allowance = period * burst as u128;

    if horizon > allowance {
        let wait_ms = div_ceil(horizon - allowance, NANOS_PER_MILLI).max(1);
        return Evaluation::Reject {
            wait_ms: saturate(wait_ms),
        };
    }

    let ttl_ms = div_ceil(horizon.max(period * 2), NANOS_PER_MILLI).max(1);
    Evaluation::Admit {
        new_tat: saturate(new_tat),
        ttl: Duration::from_millis(saturate(ttl_ms)),
    }
}

/// A decoded store reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreReply {
    Admitted,
    Rejected { retry_after: Duration },
}

impl StoreReply {
    /// Decode the raw integer returned by the store operation.
    pub fn from_raw(raw: i64) -> Result<Self, StoreError> {
        match raw {
            0 => Ok(StoreReply::Admitted),
            n if n < 0 => Ok(StoreReply::Rejected {
                retry_after: Duration::from_millis(n.unsigned_abs()),
            }),
            n => Err(StoreError::Protocol(n)),
        }
    }
}

fn div_ceil(n: u128, d: u128) -> u128 {
    (n + d - 1) / d
}

fn saturate(n: u128) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}
