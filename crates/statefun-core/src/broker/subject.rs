// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Subject naming and wildcard matching.
//!
//! | Purpose | Subject |
//! |---------|---------|
//! | Global signal | `signal.<domain>.<type>.<id>` |
//! | Domain ingress | `$SI.<domain>.<rest>` |
//! | Domain egress | `$SE.<domain>.<rest>` |
//! | Request | `request.<domain>.<type>.<id>` |
//! | Egress (leaves the cluster) | `egress.<type>.<id>` |
//! | Trace events | `trace.<domain>.events.<trace_id>` |

/// Prefix of domain-local ingress subjects.
pub const INGRESS_PREFIX: &str = "$SI";
/// Prefix of domain-local egress subjects.
pub const EGRESS_PREFIX: &str = "$SE";

/// Match a subject against a pattern with `*` (one token) and `>` (one or more
/// trailing tokens) wildcards.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// `signal.<domain>.<type>.<id>`
pub fn signal(domain: &str, typename: &str, id: &str) -> String {
    format!("signal.{domain}.{typename}.{id}")
}

/// `$SI.<domain>.<rest>`
pub fn ingress(domain: &str, rest: &str) -> String {
    format!("{INGRESS_PREFIX}.{domain}.{rest}")
}

/// `$SE.<domain>.<rest>`
pub fn egress(domain: &str, rest: &str) -> String {
    format!("{EGRESS_PREFIX}.{domain}.{rest}")
}

/// `request.<domain>.<type>.<id>`
pub fn request(domain: &str, typename: &str, id: &str) -> String {
    format!("request.{domain}.{typename}.{id}")
}

/// `egress.<type>.<id>`
pub fn egress_out(typename: &str, id: &str) -> String {
    format!("egress.{typename}.{id}")
}

/// `trace.<domain>.events.<trace_id>`
pub fn trace_events(domain: &str, trace_id: &str) -> String {
    format!("trace.{domain}.events.{trace_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_match() {
        assert!(matches("a.b.c", "a.b.c"));
        assert!(!matches("a.b.c", "a.b"));
        assert!(!matches("a.b", "a.b.c"));
    }

    #[test]
    fn test_star_matches_one_token() {
        assert!(matches("request.hub.echo.*", "request.hub.echo.42"));
        assert!(!matches("request.hub.echo.*", "request.hub.echo"));
        assert!(!matches("request.hub.echo.*", "request.hub.echo.42.x"));
    }

    #[test]
    fn test_gt_matches_tail() {
        assert!(matches("signal.>", "signal.hub.echo.1"));
        assert!(matches("$SE.a.>", "$SE.a.signal.b.t.1"));
        assert!(!matches("signal.>", "signal"));
        assert!(!matches("$SE.a.>", "$SE.b.signal.b.t.1"));
    }

    #[test]
    fn test_builders() {
        assert_eq!(signal("hub", "app.echo", "1"), "signal.hub.app.echo.1");
        assert_eq!(ingress("a", "signal.a.t.1"), "$SI.a.signal.a.t.1");
        assert_eq!(egress("a", "signal.b.t.1"), "$SE.a.signal.b.t.1");
        assert_eq!(request("a", "t", "1"), "request.a.t.1");
        assert_eq!(egress_out("t", "1"), "egress.t.1");
        assert_eq!(trace_events("a", "x"), "trace.a.events.x");
    }
}
