//! Server-side Lua scripts.

/// Moves due members of the delay set into the stream.
///
/// KEYS[1] delay set, KEYS[2] stream.
/// ARGV[1] now in ms, ARGV[2] approximate max length (0 = none), ARGV[3] batch limit.
///
/// Members are `<id>:<payload>`; the payload is appended under the `message` field.
pub const MOVE_DUE: &str = r#"
redis.replicate_commands()
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[3])
local moved = 0
for _, member in ipairs(due) do
    local sep = string.find(member, ':', 1, true)
    if sep then
        local payload = string.sub(member, sep + 1)
        if tonumber(ARGV[2]) > 0 then
            redis.call('XADD', KEYS[2], 'MAXLEN', '~', ARGV[2], '*', 'message', payload)
        else
            redis.call('XADD', KEYS[2], '*', 'message', payload)
        end
        moved = moved + 1
    end
    redis.call('ZREM', KEYS[1], member)
end
return moved
"#;
