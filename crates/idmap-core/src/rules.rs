//! Administrator name-translation rules.
//!
//! A rule pairs a windows name pattern (`name`, `*`, or empty) in a windows
//! domain pattern with a unix name pattern. Every rule gets a rank per
//! direction; matching walks the compatible rules in ascending rank order,
//! so the most specific and most restrictive rule wins.
//!
//! Windows to unix ranks:
//!
//! | rank | winname | windomain | unixname |
//! |------|---------|-----------|----------|
//! | 1    | name    | domain    | empty    |
//! | 2    | name    | domain    | name     |
//! | 3    | name    | `*`       | empty    |
//! | 4    | name    | `*`       | name     |
//! | 5    | `*`     | domain    | `*`      |
//! | 6    | `*`     | domain    | empty    |
//! | 7    | `*`     | domain    | name     |
//! | 8    | `*`     | `*`       | `*`      |
//! | 9    | `*`     | `*`       | empty    |
//! | 10   | `*`     | `*`       | name     |
//!
//! Unix to windows ranks:
//!
//! | rank | unixname | winname |
//! |------|----------|---------|
//! | 1    | name     | empty   |
//! | 2    | name     | name    |
//! | 3    | `*`      | `*`     |
//! | 4    | `*`      | empty   |
//! | 5    | `*`      | name    |
//!
//! An empty pattern is either the empty string or `""`.

use rusqlite::types::Value;
use rusqlite::{Row, params, params_from_iter};
use tracing::{debug, info};

use crate::error::{IdmapError, PrincipalType, RuleDirection};
use crate::nameservice::NameService;
use crate::sid::{Direction, Sid};
use crate::store::StoreHandle;
use crate::wellknown;

const WILDCARD: &str = "*";

fn is_empty_pattern(s: &str) -> bool {
    s.is_empty() || s == "\"\""
}

fn is_wildcard(s: &str) -> bool {
    s == WILDCARD
}

// =============================================================================
// Rules and ranks
// =============================================================================

/// A name-translation rule as supplied by an administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRule {
    /// Applies to users (`true`) or groups.
    pub is_user: bool,
    /// Windows domain pattern; `None` takes the default.
    pub windomain: Option<String>,
    /// Windows name pattern.
    pub winname: String,
    /// Windows name is in NT4 `DOMAIN\name` form.
    pub is_nt4: bool,
    /// Unix name pattern.
    pub unixname: String,
    /// Directions the rule applies to.
    pub direction: Direction,
}

impl NameRule {
    /// A rule with no domain.
    pub fn new(
        is_user: bool,
        winname: impl Into<String>,
        unixname: impl Into<String>,
        direction: Direction,
    ) -> Self {
        Self {
            is_user,
            windomain: None,
            winname: winname.into(),
            is_nt4: false,
            unixname: unixname.into(),
            direction,
        }
    }

    /// Sets the windows domain pattern (builder pattern).
    #[must_use]
    pub fn with_windomain(mut self, windomain: impl Into<String>) -> Self {
        self.windomain = Some(windomain.into());
        self
    }

    /// Marks the windows name as NT4 style (builder pattern).
    #[must_use]
    pub const fn with_nt4(mut self, is_nt4: bool) -> Self {
        self.is_nt4 = is_nt4;
        self
    }
}

/// Ranks of a rule. A direction the rule does not apply to has no rank.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleRanks {
    /// Windows to unix rank, 1 to 10.
    pub w2u: Option<u8>,
    /// Unix to windows rank, 1 to 5.
    pub u2w: Option<u8>,
}

impl RuleRanks {
    /// Direction implied by which ranks are set.
    #[must_use]
    pub const fn direction(self) -> Direction {
        match (self.w2u, self.u2w) {
            (Some(_), None) => Direction::WinToUnix,
            (None, Some(_)) => Direction::UnixToWin,
            _ => Direction::Bidirectional,
        }
    }
}

fn w2u_rank(winname: &str, windomain: Option<&str>, unixname: &str) -> Result<u8, IdmapError> {
    let invalid = IdmapError::InvalidRule(RuleDirection::W2u);
    if is_empty_pattern(winname) {
        return Err(invalid);
    }
    let any_domain = windomain.is_some_and(is_wildcard);
    // Offset within a tier: wildcard, empty, then literal target.
    let target = if is_wildcard(unixname) {
        0
    } else if is_empty_pattern(unixname) {
        1
    } else {
        2
    };

    if is_wildcard(winname) {
        return Ok(if any_domain { 8 + target } else { 5 + target });
    }
    if target == 0 {
        return Err(invalid);
    }
    Ok(if any_domain { 2 + target } else { target })
}

fn u2w_rank(winname: &str, windomain: Option<&str>, unixname: &str) -> Result<u8, IdmapError> {
    let invalid = IdmapError::InvalidRule(RuleDirection::U2w);
    if is_empty_pattern(unixname) || windomain.is_some_and(is_wildcard) {
        return Err(invalid);
    }
    let target = if is_wildcard(winname) {
        0
    } else if is_empty_pattern(winname) {
        1
    } else {
        2
    };

    if is_wildcard(unixname) {
        return Ok(3 + target);
    }
    if target == 0 {
        return Err(invalid);
    }
    Ok(target)
}

/// Computes the ranks of a rule for the directions it applies to.
///
/// # Errors
///
/// Fails with [`IdmapError::InvalidRule`] for pattern combinations that have
/// no rank, such as a literal name mapped to a wildcard.
pub fn rule_rank(
    direction: Direction,
    winname: &str,
    windomain: Option<&str>,
    unixname: &str,
) -> Result<RuleRanks, IdmapError> {
    let w2u = if direction.allows_w2u() {
        Some(w2u_rank(winname, windomain, unixname)?)
    } else {
        None
    };
    let u2w = if direction.allows_u2w() {
        Some(u2w_rank(winname, windomain, unixname)?)
    } else {
        None
    };
    Ok(RuleRanks { w2u, u2w })
}

// =============================================================================
// Administration
// =============================================================================

/// Stores a rule and returns its ranks.
///
/// A rule without a domain gets no domain when its windows name is a
/// well-known principal, else `mapping_domain`.
///
/// # Errors
///
/// [`IdmapError::InvalidRule`] for an unrankable rule and
/// [`IdmapError::RuleConflict`] when it collides with a stored rule.
pub fn add_rule(
    store: &mut StoreHandle,
    rule: &NameRule,
    mapping_domain: Option<&str>,
) -> Result<RuleRanks, IdmapError> {
    let ranks = rule_rank(
        rule.direction,
        &rule.winname,
        rule.windomain.as_deref(),
        &rule.unixname,
    )?;
    let windomain = match rule.windomain.as_deref() {
        Some(domain) => domain,
        None if wellknown::lookup_name2sid(&rule.winname).is_some() => "",
        None => mapping_domain.unwrap_or(""),
    };

    store.with_retry(|conn| {
        conn.execute(
            "INSERT INTO namerules \
             (is_user, windomain, winname, is_nt4, unixname, w2u_order, u2w_order) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rule.is_user,
                windomain,
                rule.winname,
                rule.is_nt4,
                rule.unixname,
                ranks.w2u,
                ranks.u2w,
            ],
        )
    })?;
    info!(
        winname = %rule.winname,
        windomain = %windomain,
        unixname = %rule.unixname,
        is_user = rule.is_user,
        w2u = ?ranks.w2u,
        u2w = ?ranks.u2w,
        "name rule added"
    );
    Ok(ranks)
}

/// Selects rules for [`remove_rule`] and [`list_rules`]. String filters match
/// exactly; `None` or empty matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleFilter {
    /// Users or groups. Required for removal.
    pub is_user: Option<bool>,
    /// Windows domain.
    pub windomain: Option<String>,
    /// Windows name.
    pub winname: Option<String>,
    /// Unix name.
    pub unixname: Option<String>,
    /// Only rules valid in exactly this direction.
    pub direction: Option<Direction>,
}

impl RuleFilter {
    /// Filter for one principal kind (builder pattern entry point).
    #[must_use]
    pub fn for_kind(is_user: bool) -> Self {
        Self {
            is_user: Some(is_user),
            ..Self::default()
        }
    }

    fn names(&self) -> [(&'static str, Option<&str>); 3] {
        [
            ("windomain", self.windomain.as_deref()),
            ("winname", self.winname.as_deref()),
            ("unixname", self.unixname.as_deref()),
        ]
    }

    fn selects_nothing_specific(&self) -> bool {
        self.direction.is_none() && self.names().iter().all(|(_, v)| v.map_or(true, str::is_empty))
    }

    /// `WHERE` clause body and its positional values.
    fn to_sql(&self) -> (String, Vec<Value>) {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(is_user) = self.is_user {
            values.push(Value::Integer(i64::from(is_user)));
            clauses.push(format!("is_user = ?{}", values.len()));
        }
        for (column, value) in self.names() {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                values.push(Value::Text(value.to_string()));
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
        if let Some(direction) = self.direction {
            clauses.push(
                match direction {
                    Direction::Bidirectional => "w2u_order > 0 AND u2w_order > 0",
                    Direction::WinToUnix => {
                        "w2u_order > 0 AND (u2w_order = 0 OR u2w_order IS NULL)"
                    },
                    Direction::UnixToWin => {
                        "u2w_order > 0 AND (w2u_order = 0 OR w2u_order IS NULL)"
                    },
                }
                .to_string(),
            );
        }
        if clauses.is_empty() {
            clauses.push("1".to_string());
        }
        (clauses.join(" AND "), values)
    }
}

/// Deletes the rules selected by `filter` and returns how many went.
///
/// A filter with no direction and no names is a no-op.
///
/// # Errors
///
/// [`IdmapError::InvalidArgument`] when the filter has no user or group
/// selector, [`IdmapError::Internal`] when the store fails.
pub fn remove_rule(store: &mut StoreHandle, filter: &RuleFilter) -> Result<usize, IdmapError> {
    if filter.is_user.is_none() {
        return Err(IdmapError::InvalidArgument(
            "rule removal needs a user or group selector".to_string(),
        ));
    }
    if filter.selects_nothing_specific() {
        debug!("empty rule filter, nothing removed");
        return Ok(0);
    }
    let (clause, values) = filter.to_sql();
    let sql = format!("DELETE FROM namerules WHERE {clause}");
    let removed =
        store.with_retry(|conn| conn.execute(&sql, params_from_iter(values.iter())))?;
    info!(removed, "name rules removed");
    Ok(removed)
}

/// Deletes every user (`is_user`) or group rule.
///
/// # Errors
///
/// [`IdmapError::Internal`] when the store fails.
pub fn flush_rules(store: &mut StoreHandle, is_user: bool) -> Result<usize, IdmapError> {
    let removed = store.with_retry(|conn| {
        conn.execute("DELETE FROM namerules WHERE is_user = ?1", params![is_user])
    })?;
    info!(removed, is_user, "name rules flushed");
    Ok(removed)
}

/// A stored rule with its ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    /// The rule, with its direction derived from the ranks.
    pub rule: NameRule,
    /// Stored ranks.
    pub ranks: RuleRanks,
}

fn rank_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<u8>> {
    Ok(row
        .get::<_, Option<i64>>(idx)?
        .filter(|&r| r > 0)
        .and_then(|r| u8::try_from(r).ok()))
}

fn rule_record(row: &Row<'_>) -> rusqlite::Result<RuleRecord> {
    let ranks = RuleRanks {
        w2u: rank_column(row, 5)?,
        u2w: rank_column(row, 6)?,
    };
    Ok(RuleRecord {
        rule: NameRule {
            is_user: row.get(0)?,
            windomain: row.get(1)?,
            winname: row.get(2)?,
            is_nt4: row.get(3)?,
            unixname: row.get(4)?,
            direction: ranks.direction(),
        },
        ranks,
    })
}

/// Lists the rules selected by `filter`, in insertion order.
///
/// # Errors
///
/// [`IdmapError::Internal`] when the store fails.
pub fn list_rules(
    store: &mut StoreHandle,
    filter: &RuleFilter,
    limit: Option<u32>,
) -> Result<Vec<RuleRecord>, IdmapError> {
    let (clause, mut values) = filter.to_sql();
    values.push(Value::Integer(limit.map_or(-1, i64::from)));
    let sql = format!(
        "SELECT is_user, windomain, winname, is_nt4, unixname, w2u_order, u2w_order \
         FROM namerules WHERE {clause} ORDER BY rowid LIMIT ?{}",
        values.len()
    );
    store.with_retry(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), rule_record)?;
        rows.collect()
    })
}

// =============================================================================
// Matching
// =============================================================================

/// A windows-to-unix rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct W2uMatch {
    /// Resolved uid or gid.
    pub pid: u32,
    /// Unix account name.
    pub unixname: String,
    /// Bidirectional when the rule also ranks unix to windows.
    pub direction: Direction,
}

/// Finds the unix account for `winname@windomain` through the rules.
///
/// # Errors
///
/// Fails with [`IdmapError::NotFound`] when no rule applies, letting the
/// caller fall back to an ephemeral id, and with [`IdmapError::NoMapping`]
/// when the winning rule denies the mapping or names an account that does
/// not exist.
pub fn match_w2u(
    store: &mut StoreHandle,
    names: &dyn NameService,
    winname: &str,
    windomain: Option<&str>,
    mapping_domain: Option<&str>,
    is_user: bool,
) -> Result<W2uMatch, IdmapError> {
    let domain = windomain.or(mapping_domain).unwrap_or("");
    let is_default_domain = match (windomain, mapping_domain) {
        (None, _) => true,
        (Some(d), Some(m)) => d.eq_ignore_ascii_case(m),
        (Some(_), None) => false,
    };

    let candidates: Vec<(String, Option<i64>)> = store.with_retry(|conn| {
        let mut stmt = conn.prepare(
            "SELECT unixname, u2w_order FROM namerules \
             WHERE w2u_order > 0 AND is_user = ?1 \
             AND (winname = ?2 OR winname = '*') \
             AND (windomain = ?3 OR windomain = '*' \
                  OR (?4 AND (windomain IS NULL OR windomain = ''))) \
             ORDER BY w2u_order ASC",
        )?;
        let rows = stmt.query_map(params![is_user, winname, domain, is_default_domain], |r| {
            Ok((r.get(0)?, r.get(1)?))
        })?;
        rows.collect()
    })?;

    for (unixname, u2w_order) in candidates {
        if is_empty_pattern(&unixname) {
            debug!(winname = %winname, domain = %domain, "rule denies mapping");
            return Err(IdmapError::NoMapping);
        }
        let wildcard = is_wildcard(&unixname);
        let target = if wildcard { winname } else { unixname.as_str() };
        match names.lookup_by_name(is_user, target) {
            Ok(pid) => {
                return Ok(W2uMatch {
                    pid,
                    unixname: target.to_string(),
                    direction: Direction::from_w2u(u2w_order.is_some_and(|o| o > 0)),
                });
            },
            // No same-named account: try the next rule.
            Err(IdmapError::NotFound) if wildcard => {},
            Err(IdmapError::NotFound) => {
                debug!(unixname = %target, "rule target has no unix account");
                return Err(IdmapError::NoMapping);
            },
            Err(e) => return Err(e),
        }
    }
    Err(IdmapError::NotFound)
}

/// A unix-to-windows rule match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct U2wMatch {
    /// Resolved SID.
    pub sid: Sid,
    /// Windows name the rule produced.
    pub winname: String,
    /// Windows domain the rule produced.
    pub windomain: String,
    /// Bidirectional when the rule also ranks windows to unix.
    pub direction: Direction,
}

/// Finds the windows principal for `unixname` through the rules.
///
/// `resolve` turns `(winname, windomain)` into a SID and principal type; a
/// [`IdmapError::NotFound`] from it moves on to the next rule only when the
/// current rule's windows name is a wildcard.
///
/// # Errors
///
/// [`IdmapError::NotFound`] when no rule applies, [`IdmapError::NoMapping`]
/// when the winning rule denies the mapping, and [`IdmapError::DomainNotFound`]
/// when no domain can be chosen for the windows name.
pub fn match_u2w<F>(
    store: &mut StoreHandle,
    unixname: &str,
    is_user: bool,
    mapping_domain: Option<&str>,
    mut resolve: F,
) -> Result<U2wMatch, IdmapError>
where
    F: FnMut(&str, &str) -> Result<(Sid, PrincipalType), IdmapError>,
{
    let candidates: Vec<(String, Option<String>, Option<i64>)> = store.with_retry(|conn| {
        let mut stmt = conn.prepare(
            "SELECT winname, windomain, w2u_order FROM namerules \
             WHERE u2w_order > 0 AND is_user = ?1 \
             AND (unixname = ?2 OR unixname = '*') \
             ORDER BY u2w_order ASC",
        )?;
        let rows = stmt.query_map(params![is_user, unixname], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })?;
        rows.collect()
    })?;

    let expected = PrincipalType::from_is_user(is_user);
    for (winname, windomain, w2u_order) in candidates {
        if is_empty_pattern(&winname) {
            debug!(unixname = %unixname, "rule denies mapping");
            return Err(IdmapError::NoMapping);
        }
        let wildcard = is_wildcard(&winname);
        let winname = if wildcard { unixname.to_string() } else { winname };
        let windomain = match (windomain, mapping_domain) {
            (Some(domain), _) => domain,
            (None, Some(default)) => default.to_string(),
            (None, None) => return Err(IdmapError::DomainNotFound),
        };

        match resolve(&winname, &windomain) {
            Ok((_, found)) if found != expected => {
                return Err(IdmapError::TypeMismatch { expected, found });
            },
            Ok((sid, _)) => {
                return Ok(U2wMatch {
                    sid,
                    winname,
                    windomain,
                    direction: Direction::from_u2w(w2u_order.is_some_and(|o| o > 0)),
                });
            },
            Err(IdmapError::NotFound) if wildcard => {},
            Err(IdmapError::NotFound) => return Err(IdmapError::NoMapping),
            Err(e) => return Err(e),
        }
    }
    Err(IdmapError::NotFound)
}
