//! Federation route table.
//!
//! `REGISTER_PBX` installs glob patterns (`*@sub.example.com` style) for a
//! peer connection. When a dialled address resolves to no local
//! connection and no wake profile, the exchange consults this table and
//! forwards the frame to the matching peer instead of rejecting.

use crate::connection::SessionId;

/// One installed route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub pattern: String,
    pub session: SessionId,
}

/// Glob match with `*` wildcards, ASCII case-insensitive (domains are
/// case-insensitive; local parts in patterns are expected to be `*`).
#[must_use]
pub fn pattern_matches(pattern: &str, address: &str) -> bool {
    let p: Vec<u8> = pattern.bytes().map(|b| b.to_ascii_lowercase()).collect();
    let a: Vec<u8> = address.bytes().map(|b| b.to_ascii_lowercase()).collect();

    // Iterative two-pointer glob: star remembers the last `*` so the
    // match can backtrack by letting it swallow one more byte.
    let (mut pi, mut ai) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while ai < a.len() {
        if pi < p.len() && (p[pi] == a[ai]) {
            pi += 1;
            ai += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ai));
            pi += 1;
        } else if let Some((sp, sa)) = star {
            pi = sp + 1;
            ai = sa + 1;
            star = Some((sp, sa + 1));
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }
    pi == p.len()
}

/// Installed routes, in announcement order.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the routes announced by `session`.
    pub fn install(&mut self, session: SessionId, patterns: &[String]) {
        self.routes.retain(|r| r.session != session);
        for pattern in patterns {
            self.routes.push(Route {
                pattern: pattern.clone(),
                session,
            });
        }
    }

    /// Drop every route announced by `session`.
    pub fn remove_session(&mut self, session: SessionId) {
        self.routes.retain(|r| r.session != session);
    }

    /// First peer whose pattern matches `address`.
    #[must_use]
    pub fn lookup(&self, address: &str) -> Option<SessionId> {
        self.routes
            .iter()
            .find(|r| pattern_matches(&r.pattern, address))
            .map(|r| r.session)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
