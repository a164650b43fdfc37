//! Canonical key-builder helpers. Every component that
//! touches the KV store calls one of these instead of formatting keys by hand,
//! mirroring `build_*_key` in the original `redis_namespaces` module.

use std::time::Duration;

pub const SESSION_TTL: Duration = Duration::from_secs(7200);
pub const CHAT_HISTORY_TTL: Duration = Duration::from_secs(86400);
pub const WORKFLOW_TTL_ACTIVE: Duration = Duration::from_secs(3600);
pub const WORKFLOW_TTL_COMPLETED: Duration = Duration::from_secs(300);
pub const CONTEXT_TTL: Duration = Duration::from_secs(3600);
pub const CACHE_TTL_DEFAULT: Duration = Duration::from_secs(3600);
pub const WS_BUFFER_TTL: Duration = Duration::from_secs(300);
pub const CRON_LOCK_TTL: Duration = Duration::from_secs(300);
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(900);
pub const PRESENCE_TTL: Duration = Duration::from_secs(86400);
pub const LISTENER_RECORD_TTL: Duration = Duration::from_secs(90);

pub fn session_key(uid: &str, company_id: &str) -> String {
    format!("session:{uid}:{company_id}:state")
}

pub fn chat_history_key(uid: &str, company_id: &str, thread_key: &str) -> String {
    format!("chat:{uid}:{company_id}:{thread_key}:history")
}

pub fn chat_channel(uid: &str, company_id: &str, thread_key: &str) -> String {
    format!("chat:{uid}:{company_id}:{thread_key}")
}

pub fn workflow_state_key(uid: &str, company_id: &str, thread_key: &str) -> String {
    format!("workflow:{uid}:{company_id}:{thread_key}:state")
}

pub fn user_channel(uid: &str) -> String {
    format!("user:{uid}")
}

pub fn context_cache_key(uid: &str, company_id: &str) -> String {
    format!("context:{uid}:{company_id}")
}

/// `sub` is an optional module-specific sub-key, e.g. the COA cache keys by account type.
pub fn business_cache_key(uid: &str, company_id: &str, cache_type: &str, sub: Option<&str>) -> String {
    match sub {
        Some(sub) => format!("cache:{uid}:{company_id}:{cache_type}:{sub}"),
        None => format!("cache:{uid}:{company_id}:{cache_type}"),
    }
}

/// Matches every key for one cache type (with or without a `sub` suffix),
/// used by `invalidate_module_cache` and `get_cache_stats`.
pub fn business_cache_scan_pattern(uid: &str, company_id: &str, cache_type: &str) -> String {
    format!("cache:{uid}:{company_id}:{cache_type}*")
}

/// Matches every cached entry for a user/company regardless of type, used by
/// `get_cache_stats` when no `data_type` filter is given.
pub fn business_cache_all_pattern(uid: &str, company_id: &str) -> String {
    format!("cache:{uid}:{company_id}:*")
}

pub fn ws_buffer_key(uid: &str, thread_key: &str) -> String {
    format!("pending_ws_messages:{uid}:{thread_key}")
}

pub fn cron_lock_key(task_id: &str) -> String {
    format!("lock:cron:{task_id}")
}

pub fn idempotency_key(key: &str) -> String {
    format!("idemp:{key}")
}

pub fn presence_key(uid: &str) -> String {
    format!("registry:user:{uid}")
}

/// `listener_type` is e.g. `"notifications"`, `"chat"`, `"workflow"`, `"transaction"`;
/// `space` and `thread` are only present for on-demand chat/workflow watchers.
pub fn listener_record_key(
    uid: &str,
    listener_type: &str,
    space_and_thread: Option<(&str, &str)>,
) -> String {
    match space_and_thread {
        Some((space, thread)) => format!("registry:listeners:{uid}:{listener_type}:{space}:{thread}"),
        None => format!("registry:listeners:{uid}:{listener_type}"),
    }
}

/// Session/chat/workflow listing keys share a prefix scan pattern: everything
/// up to but excluding the trailing `{company_id}...` segment, with `*` appended.
pub fn session_scan_pattern(uid: &str) -> String {
    format!("session:{uid}:*")
}

pub fn chat_scan_pattern(uid: &str, company_id: &str) -> String {
    format!("chat:{uid}:{company_id}:*:history")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_matches_canonical_layout() {
        assert_eq!(session_key("u1", "c1"), "session:u1:c1:state");
    }

    #[test]
    fn chat_history_key_matches_canonical_layout() {
        assert_eq!(
            chat_history_key("u1", "c1", "t1"),
            "chat:u1:c1:t1:history"
        );
    }

    #[test]
    fn business_cache_key_with_and_without_sub() {
        assert_eq!(
            business_cache_key("u1", "c1", "coa", None),
            "cache:u1:c1:coa"
        );
        assert_eq!(
            business_cache_key("u1", "c1", "coa", Some("assets")),
            "cache:u1:c1:coa:assets"
        );
    }

    #[test]
    fn chat_scan_pattern_matches_history_keys() {
        let pattern = chat_scan_pattern("u1", "c1");
        assert_eq!(pattern, "chat:u1:c1:*:history");
    }

    #[test]
    fn business_cache_scan_pattern_covers_subtyped_keys() {
        assert_eq!(
            business_cache_scan_pattern("u1", "c1", "coa"),
            "cache:u1:c1:coa*"
        );
    }
}
