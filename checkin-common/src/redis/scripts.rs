//! Server-side Lua. Everything that must be atomic across several keys runs
//! as one script, so no other client can interleave with it.

/// KEYS: filter. ARGV: bit positions. Returns 1 when every bit was already set.
pub const TEST_AND_ADD: &str = r"
local newly_set = 0
for i = 1, #ARGV do
    newly_set = newly_set + 1 - redis.call('SETBIT', KEYS[1], ARGV[i], 1)
end
if newly_set == 0 then
    return 1
end
return 0
";

/// KEYS: filter, log. ARGV: max length, locationId, userId, starRating, bit positions...
/// Returns the new entry id, or nil for a duplicate.
pub const ADMIT: &str = r"
local seen = true
for i = 5, #ARGV do
    if redis.call('GETBIT', KEYS[1], ARGV[i]) == 0 then
        seen = false
        break
    end
end
if seen then
    return false
end

local id = redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[1], '*',
    'locationId', ARGV[2], 'userId', ARGV[3], 'starRating', ARGV[4])

for i = 5, #ARGV do
    redis.call('SETBIT', KEYS[1], ARGV[i], 1)
end
return id
";

/// Shared by both commit scripts.
const APPLY_CHECKIN: &str = r"
local function apply_checkin(user_key, location_key, timestamp, location_id, star_rating)
    local last_checkin = tonumber(redis.call('HGET', user_key, 'lastCheckin') or '0') or 0
    local recency_updated = 0
    if tonumber(timestamp) > last_checkin then
        redis.call('HSET', user_key, 'lastCheckin', timestamp, 'lastSeenAt', location_id)
        recency_updated = 1
    end

    local user_checkins = redis.call('HINCRBY', user_key, 'numCheckins', 1)
    local location_checkins = redis.call('HINCRBY', location_key, 'numCheckins', 1)
    local location_stars = redis.call('HINCRBY', location_key, 'numStars', star_rating)
    local average_stars = math.floor(location_stars / location_checkins + 0.5)
    redis.call('HSET', location_key, 'averageStars', average_stars)

    return {recency_updated, user_checkins, location_checkins, location_stars, average_stars}
end
";

/// Stream ids compared numerically, `<millis>-<sequence>`.
const IS_AFTER: &str = r"
local function split_id(id)
    local dash = string.find(id, '-', 1, true)
    return tonumber(string.sub(id, 1, dash - 1)), tonumber(string.sub(id, dash + 1))
end

local function is_after(id, other)
    if not other then
        return true
    end
    local millis, sequence = split_id(id)
    local other_millis, other_sequence = split_id(other)
    return millis > other_millis or (millis == other_millis and sequence > other_sequence)
end
";

/// KEYS: log, user, location. ARGV: group, id, timestamp, locationId, starRating.
/// Returns {0} when the entry is not pending in the group, otherwise
/// {1, recency_updated, user_checkins, location_checkins, location_stars, average_stars}.
const GROUP_COMMIT_BODY: &str = r"
local pending = redis.call('XPENDING', KEYS[1], ARGV[1], ARGV[2], ARGV[2], 1)
if #pending == 0 then
    return {0}
end

local result = apply_checkin(KEYS[2], KEYS[3], ARGV[3], ARGV[4], ARGV[5])
redis.call('XACK', KEYS[1], ARGV[1], ARGV[2])
return {1, unpack(result)}
";

/// KEYS: checkpoint, user, location. ARGV: id, timestamp, locationId, starRating.
/// Same reply shape as the group commit.
const CHECKPOINT_COMMIT_BODY: &str = r"
if not is_after(ARGV[1], redis.call('GET', KEYS[1])) then
    return {0}
end

local result = apply_checkin(KEYS[2], KEYS[3], ARGV[2], ARGV[3], ARGV[4])
redis.call('SET', KEYS[1], ARGV[1])
return {1, unpack(result)}
";

/// KEYS: checkpoint. ARGV: id. Returns 1 when the checkpoint moved.
const SET_CHECKPOINT_BODY: &str = r"
if not is_after(ARGV[1], redis.call('GET', KEYS[1])) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[1])
return 1
";

pub fn group_commit() -> String {
    format!("{APPLY_CHECKIN}\n{GROUP_COMMIT_BODY}")
}

pub fn checkpoint_commit() -> String {
    format!("{IS_AFTER}\n{APPLY_CHECKIN}\n{CHECKPOINT_COMMIT_BODY}")
}

pub fn set_checkpoint() -> String {
    format!("{IS_AFTER}\n{SET_CHECKPOINT_BODY}")
}
