//! Firewall rules for routed data messages.
//!
//! Rules arrive as typed records (`FirewallRuleData`, from config) or as
//! compact strings (`"FromNode=foo, ToService=/ctl.*/: drop"`); both compile
//! into the same `CompiledRule`. A compiled rule holds zero or more field
//! matchers plus one action. Zero matchers match every message.
//!
//! Evaluation is first-match-wins over the ordered rule list. Rules that do
//! not match return `Continue`; if every rule continues, the message is
//! accepted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::wire::MessageData;

// ── Results ───────────────────────────────────────────────────────────────────

/// What a single rule says about a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirewallResult {
    /// Rule did not match; try the next one.
    Continue,
    Accept,
    /// Discard and notify the sender with an unreachable message.
    Reject,
    /// Discard silently.
    Drop,
}

/// Terminal decision for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallAction {
    Accept,
    Reject,
    Drop,
}

impl FromStr for FirewallAction {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accept" => Ok(FirewallAction::Accept),
            "reject" => Ok(FirewallAction::Reject),
            "drop" => Ok(FirewallAction::Drop),
            _ => Err(FirewallError::UnknownAction(s.to_string())),
        }
    }
}

impl From<FirewallAction> for FirewallResult {
    fn from(a: FirewallAction) -> Self {
        match a {
            FirewallAction::Accept => FirewallResult::Accept,
            FirewallAction::Reject => FirewallResult::Reject,
            FirewallAction::Drop => FirewallResult::Drop,
        }
    }
}

// ── Rule trait ────────────────────────────────────────────────────────────────

/// Anything that can judge a message. Implemented by compiled rules and by
/// plain closures, so embedders can add programmatic rules next to
/// configured ones.
pub trait FirewallRule: Send + Sync {
    fn evaluate(&self, msg: &MessageData) -> FirewallResult;
}

impl<F> FirewallRule for F
where
    F: Fn(&MessageData) -> FirewallResult + Send + Sync,
{
    fn evaluate(&self, msg: &MessageData) -> FirewallResult {
        self(msg)
    }
}

// ── Rule data ─────────────────────────────────────────────────────────────────

/// Configuration form of a rule. Values are literal strings, or anchored
/// regular expressions when wrapped in slashes (`/a.*b/`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FirewallRuleData {
    #[serde(alias = "Action")]
    pub action: String,
    #[serde(default, alias = "FromNode", skip_serializing_if = "Option::is_none")]
    pub fromnode: Option<String>,
    #[serde(default, alias = "ToNode", skip_serializing_if = "Option::is_none")]
    pub tonode: Option<String>,
    #[serde(default, alias = "FromService", skip_serializing_if = "Option::is_none")]
    pub fromservice: Option<String>,
    #[serde(default, alias = "ToService", skip_serializing_if = "Option::is_none")]
    pub toservice: Option<String>,
}

impl FirewallRuleData {
    pub fn compile(&self) -> Result<CompiledRule, FirewallError> {
        let action = self.action.parse()?;
        let mut matchers = Vec::new();
        for (field, value) in [
            (Field::FromNode, &self.fromnode),
            (Field::ToNode, &self.tonode),
            (Field::FromService, &self.fromservice),
            (Field::ToService, &self.toservice),
        ] {
            if let Some(value) = value {
                matchers.push((field, Matcher::parse(value)?));
            }
        }
        Ok(CompiledRule { matchers, action })
    }

    fn set(&mut self, field: Field, value: String) {
        let slot = match field {
            Field::FromNode => &mut self.fromnode,
            Field::ToNode => &mut self.tonode,
            Field::FromService => &mut self.fromservice,
            Field::ToService => &mut self.toservice,
        };
        *slot = Some(value);
    }
}

// ── Matchers ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    FromNode,
    ToNode,
    FromService,
    ToService,
}

impl Field {
    fn select(self, msg: &MessageData) -> &str {
        match self {
            Field::FromNode => &msg.from_node,
            Field::ToNode => &msg.to_node,
            Field::FromService => &msg.from_service,
            Field::ToService => &msg.to_service,
        }
    }
}

impl FromStr for Field {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fromnode" => Ok(Field::FromNode),
            "tonode" => Ok(Field::ToNode),
            "fromservice" => Ok(Field::FromService),
            "toservice" => Ok(Field::ToService),
            _ => Err(FirewallError::UnknownField(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    Exact(String),
    Regex(Regex),
}

impl Matcher {
    /// `/.../` compiles to a regex anchored at both ends; anything else is
    /// an exact, case-sensitive comparison.
    pub fn parse(value: &str) -> Result<Self, FirewallError> {
        match value.strip_prefix('/').and_then(|v| v.strip_suffix('/')) {
            Some(pattern) => {
                let anchored = format!("^(?:{pattern})$");
                Regex::new(&anchored)
                    .map(Matcher::Regex)
                    .map_err(|source| FirewallError::BadRegex {
                        pattern: pattern.to_string(),
                        source,
                    })
            }
            None => Ok(Matcher::Exact(value.to_string())),
        }
    }

    pub fn matches(&self, s: &str) -> bool {
        match self {
            Matcher::Exact(v) => v == s,
            Matcher::Regex(re) => re.is_match(s),
        }
    }
}

/// A rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    matchers: Vec<(Field, Matcher)>,
    action: FirewallAction,
}

impl CompiledRule {
    pub fn action(&self) -> FirewallAction {
        self.action
    }
}

impl FirewallRule for CompiledRule {
    fn evaluate(&self, msg: &MessageData) -> FirewallResult {
        if self
            .matchers
            .iter()
            .all(|(field, m)| m.matches(field.select(msg)))
        {
            self.action.into()
        } else {
            FirewallResult::Continue
        }
    }
}

// ── Compact syntax ────────────────────────────────────────────────────────────
//
//   RULE[, RULE ...]: ACTION
//
// RULE is `all` or `field=value` / `field=/regex/`. Field names, `all` and
// the action are case-insensitive; values are not. Whitespace is optional.

impl FromStr for FirewallRuleData {
    type Err = FirewallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleParser::new(s).parse()
    }
}

struct RuleParser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> RuleParser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse(mut self) -> Result<FirewallRuleData, FirewallError> {
        let mut data = FirewallRuleData::default();
        self.skip_ws();
        let checkpoint = self.pos;
        let first = self.ident();
        self.skip_ws();
        if first.eq_ignore_ascii_case("all") && self.peek() == Some(':') {
            // matches everything
        } else {
            self.pos = checkpoint;
            loop {
                self.skip_ws();
                let field: Field = self.ident().parse()?;
                self.skip_ws();
                self.expect('=')?;
                self.skip_ws();
                let value = self.value()?;
                data.set(field, value);
                self.skip_ws();
                match self.peek() {
                    Some(',') => self.pos += 1,
                    Some(':') => break,
                    _ => return Err(self.error("expected ',' or ':'")),
                }
            }
        }
        self.expect(':')?;
        self.skip_ws();
        let action = self.ident();
        if action.is_empty() {
            return Err(self.error("missing action"));
        }
        action.parse::<FirewallAction>()?;
        data.action = action.to_string();
        self.skip_ws();
        if self.pos != self.input.len() {
            return Err(self.error("trailing input"));
        }
        Ok(data)
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let rest = self.rest();
        self.pos += rest.len() - rest.trim_start().len();
    }

    fn ident(&mut self) -> &'a str {
        let rest = self.rest();
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        self.pos += len;
        &rest[..len]
    }

    fn expect(&mut self, c: char) -> Result<(), FirewallError> {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            Ok(())
        } else {
            Err(self.error(&format!("expected '{c}'")))
        }
    }

    fn value(&mut self) -> Result<String, FirewallError> {
        let rest = self.rest();
        if rest.starts_with('/') {
            let mut escaped = false;
            for (i, c) in rest.char_indices().skip(1) {
                match c {
                    _ if escaped => escaped = false,
                    '\\' => escaped = true,
                    '/' => {
                        self.pos += i + 1;
                        return Ok(rest[..=i].to_string());
                    }
                    _ => {}
                }
            }
            return Err(self.error("unterminated regex"));
        }
        let len = rest
            .find(|c: char| matches!(c, ',' | ':' | '=') || c.is_whitespace())
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(self.error("missing value"));
        }
        self.pos += len;
        Ok(rest[..len].to_string())
    }

    fn error(&self, reason: &str) -> FirewallError {
        FirewallError::Syntax {
            input: self.input.to_string(),
            offset: self.pos,
            reason: reason.to_string(),
        }
    }
}

// ── Firewall ──────────────────────────────────────────────────────────────────

/// Ordered rule list.
#[derive(Clone, Default)]
pub struct Firewall {
    rules: Vec<Arc<dyn FirewallRule>>,
}

impl Firewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile configured rules, in order. Fails on the first bad rule and
    /// reports its index.
    pub fn compile(data: &[FirewallRuleData]) -> Result<Self, FirewallError> {
        let mut fw = Firewall::new();
        for (index, rule) in data.iter().enumerate() {
            let compiled = rule.compile().map_err(|e| FirewallError::Rule {
                index,
                source: Box::new(e),
            })?;
            fw.push(compiled);
        }
        Ok(fw)
    }

    pub fn push(&mut self, rule: impl FirewallRule + 'static) {
        self.rules.push(Arc::new(rule));
    }

    pub fn extend(&mut self, other: &Firewall) {
        self.rules.extend(other.rules.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn evaluate(&self, msg: &MessageData) -> FirewallAction {
        for rule in &self.rules {
            match rule.evaluate(msg) {
                FirewallResult::Continue => continue,
                FirewallResult::Accept => return FirewallAction::Accept,
                FirewallResult::Reject => return FirewallAction::Reject,
                FirewallResult::Drop => return FirewallAction::Drop,
            }
        }
        FirewallAction::Accept
    }
}

impl fmt::Debug for Firewall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firewall")
            .field("rules", &self.rules.len())
            .finish()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FirewallError {
    #[error("unknown firewall action: {0:?}")]
    UnknownAction(String),

    #[error("unknown firewall field: {0:?}")]
    UnknownField(String),

    #[error("regex /{pattern}/ failed to compile: {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("bad firewall rule {input:?} at offset {offset}: {reason}")]
    Syntax {
        input: String,
        offset: usize,
        reason: String,
    },

    #[error("error in firewall rule {index}: {source}")]
    Rule {
        index: usize,
        #[source]
        source: Box<FirewallError>,
    },
}

// ── Tests ─────────────────────────────────────────────────────────────────────
