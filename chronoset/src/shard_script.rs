//! The shard script: the atomic single-key LWW decision procedure.
//!
//! This module holds the decision procedure as a pure function so it can be
//! exhaustively unit tested independent of any storage backend. Each backend
//! (`MemoryBackend`, the Redis backend) is responsible for executing the
//! *same* procedure atomically against its own storage; the Redis backend
//! embeds an equivalent Lua script (`LUA_SCRIPT` below) so the capacity
//! check, monotonicity check, apply, and evict all run as one atomic unit on
//! the storage node.

/// Insert moves a member into `K+`; Delete moves it into `K-`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Insert,
    Delete,
}

impl Op {
    /// `ARGV[1]` value the Lua script expects for this operation.
    pub fn lua_flag(self) -> &'static str {
        match self {
            Op::Insert => "1",
            Op::Delete => "0",
        }
    }
}

/// Current state of a (key, member) pair as observed by the decision
/// procedure, immediately before applying a write.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurrentState {
    /// Score stored in the add-set for this member, if present there.
    pub add_score: Option<f64>,
    /// Score stored in the remove-set for this member, if present there.
    pub remove_score: Option<f64>,
    /// Number of members currently in the *target* set (`K+` for Insert,
    /// `K-` for Delete) before this write.
    pub target_len: usize,
    /// Lowest score currently in the target set, if any.
    pub target_min_score: Option<f64>,
}

/// What the caller must physically do to apply an accepted write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Mutation {
    /// Remove the member from the set that isn't the target, if it was there.
    pub remove_from_other: bool,
    /// Evict the lowest-scored member from the target set (it's at capacity).
    pub evict_min_from_target: bool,
}

/// Outcome of evaluating a write against the current state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Write is accepted; apply `Mutation` then insert (member, score) into
    /// the target set.
    Apply(Mutation),
    /// Write is a logical no-op, never surfaced as an error.
    Reject,
}

/// Evaluate the capacity check, monotonicity check, and apply/evict decision
/// for one write against one key.
///
/// `op` selects the target set (`K+` for Insert, `K-` for Delete).
/// Delete's monotonicity check is intentionally asymmetric: Insert requires
/// `score` to strictly exceed the existing add-set score, but Delete only
/// requires `score` to be `>=` the existing remove-set score, so an
/// equal-score Delete beats an equal-score Insert.
pub fn decide(op: Op, current: CurrentState, score: f64, max_size: usize) -> Decision {
    // Step 2: capacity check.
    if current.target_len >= max_size {
        if let Some(min_score) = current.target_min_score {
            if score < min_score {
                return Decision::Reject;
            }
        }
    }

    // Step 3: monotonicity against the add-set.
    let (add_bound, remove_bound) = match op {
        Op::Insert => (current.add_score, current.remove_score),
        Op::Delete => (current.remove_score, current.add_score),
    };

    if let Some(existing) = add_bound {
        if score < existing {
            return Decision::Reject;
        }
    }

    // Step 4: monotonicity against the remove-set. Insert uses strict `<`
    // (so a tie is a no-op); Delete uses `<=` (so a tie wins).
    if let Some(existing) = remove_bound {
        let loses = match op {
            Op::Insert => score <= existing,
            Op::Delete => score < existing,
        };
        if loses {
            return Decision::Reject;
        }
    }

    let was_present_elsewhere = match op {
        Op::Insert => current.remove_score.is_some(),
        Op::Delete => current.add_score.is_some(),
    };

    Decision::Apply(Mutation {
        remove_from_other: was_present_elsewhere,
        evict_min_from_target: current.target_len >= max_size,
    })
}

/// Lua source executed atomically on the storage node via `EVAL`/`EVALSHA`.
///
/// `KEYS[1]` = add-set physical key (`K+`), `KEYS[2]` = remove-set physical
/// key (`K-`). `ARGV` = `[op_flag, score, member, max_size]` where
/// `op_flag` is `1` for Insert (target = KEYS[1]) and `0` for Delete
/// (target = KEYS[2]). Returns `1` if the write was applied, `0` if rejected.
pub const LUA_SCRIPT: &str = r#"
local target_key = ARGV[1] == "1" and KEYS[1] or KEYS[2]
local other_key = ARGV[1] == "1" and KEYS[2] or KEYS[1]
local score = tonumber(ARGV[2])
local member = ARGV[3]
local max_size = tonumber(ARGV[4])
local is_insert = ARGV[1] == "1"

local target_len = redis.call("ZCARD", target_key)
if target_len >= max_size then
    local lowest = redis.call("ZRANGE", target_key, 0, 0, "WITHSCORES")
    if lowest[2] ~= nil and score < tonumber(lowest[2]) then
        return 0
    end
end

local add_score = redis.call("ZSCORE", KEYS[1], member)
local remove_score = redis.call("ZSCORE", KEYS[2], member)

local add_bound = is_insert and add_score or remove_score
local remove_bound = is_insert and remove_score or add_score

if add_bound ~= nil and score < tonumber(add_bound) then
    return 0
end

if remove_bound ~= nil then
    local loses
    if is_insert then
        loses = score <= tonumber(remove_bound)
    else
        loses = score < tonumber(remove_bound)
    end
    if loses then
        return 0
    end
end

redis.call("ZREM", other_key, member)
redis.call("ZADD", target_key, score, member)

local new_len = redis.call("ZCARD", target_key)
if new_len > max_size then
    redis.call("ZREMRANGEBYRANK", target_key, 0, new_len - max_size - 1)
end

return 1
"#;
