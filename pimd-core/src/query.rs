//! S-expression queries used to select components for listing and views.
//!
//! Supported forms:
//!
//! ```text
//! #t | #f
//! (and EXPR...)  (or EXPR...)  (not EXPR)
//! (uid? "UID")
//! (contains? "FIELD" "TEXT")      FIELD: any | summary | description | location | comment
//! (has-recurrences?)  (has-alarms?)  (has-attachments?)
//! ```

use std::fmt;
use std::str::FromStr;

use crate::component::Component;
use crate::error::{BackendError, BackendResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    True,
    False,
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    Uid(String),
    Contains { field: TextField, text: String },
    HasRecurrences,
    HasAlarms,
    HasAttachments,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextField {
    Any,
    Summary,
    Description,
    Location,
    Comment,
}

impl TextField {
    const TEXT_PROPERTIES: [&'static str; 4] = ["SUMMARY", "DESCRIPTION", "LOCATION", "COMMENT"];

    fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "any" => Some(TextField::Any),
            "summary" => Some(TextField::Summary),
            "description" => Some(TextField::Description),
            "location" => Some(TextField::Location),
            "comment" => Some(TextField::Comment),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            TextField::Any => "any",
            TextField::Summary => "summary",
            TextField::Description => "description",
            TextField::Location => "location",
            TextField::Comment => "comment",
        }
    }

    fn properties(self) -> &'static [&'static str] {
        match self {
            TextField::Any => &Self::TEXT_PROPERTIES,
            TextField::Summary => &Self::TEXT_PROPERTIES[0..1],
            TextField::Description => &Self::TEXT_PROPERTIES[1..2],
            TextField::Location => &Self::TEXT_PROPERTIES[2..3],
            TextField::Comment => &Self::TEXT_PROPERTIES[3..4],
        }
    }
}

impl Query {
    /// Query matching every component.
    pub fn all() -> Self {
        Query::True
    }

    pub fn parse(text: &str) -> BackendResult<Self> {
        let tokens = tokenize(text)?;
        let mut parser = Parser { tokens, pos: 0 };
        let query = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(BackendError::InvalidQuery(format!(
                "Unexpected trailing input in '{text}'"
            )));
        }
        Ok(query)
    }

    pub fn matches(&self, component: &Component) -> bool {
        match self {
            Query::True => true,
            Query::False => false,
            Query::And(parts) => parts.iter().all(|q| q.matches(component)),
            Query::Or(parts) => parts.iter().any(|q| q.matches(component)),
            Query::Not(inner) => !inner.matches(component),
            Query::Uid(uid) => component.uid() == Some(uid.as_str()),
            Query::Contains { field, text } => {
                let needle = text.to_lowercase();
                field.properties().iter().any(|name| {
                    component
                        .properties_named(name)
                        .any(|p| p.value.to_lowercase().contains(&needle))
                })
            }
            Query::HasRecurrences => component.has_recurrences(),
            Query::HasAlarms => component.has_alarms(),
            Query::HasAttachments => component.has_attachments(),
        }
    }
}

impl Default for Query {
    fn default() -> Self {
        Query::True
    }
}

impl FromStr for Query {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Query::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, op: &str, parts: &[Query]) -> fmt::Result {
            write!(f, "({op}")?;
            for part in parts {
                write!(f, " {part}")?;
            }
            write!(f, ")")
        }

        match self {
            Query::True => write!(f, "#t"),
            Query::False => write!(f, "#f"),
            Query::And(parts) => list(f, "and", parts),
            Query::Or(parts) => list(f, "or", parts),
            Query::Not(inner) => write!(f, "(not {inner})"),
            Query::Uid(uid) => write!(f, "(uid? {uid:?})"),
            Query::Contains { field, text } => {
                write!(f, "(contains? {:?} {:?})", field.name(), text)
            }
            Query::HasRecurrences => write!(f, "(has-recurrences?)"),
            Query::HasAlarms => write!(f, "(has-alarms?)"),
            Query::HasAttachments => write!(f, "(has-attachments?)"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
    Str(String),
}

fn tokenize(text: &str) -> BackendResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => break,
                        },
                        Some('"') => {
                            tokens.push(Token::Str(value));
                            break;
                        }
                        Some(other) => value.push(other),
                        None => {
                            return Err(BackendError::InvalidQuery(
                                "Unterminated string literal".into(),
                            ));
                        }
                    }
                }
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '(' || c == ')' || c == '"' {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> BackendResult<Query> {
        match self.next() {
            Some(Token::Atom(atom)) if atom == "#t" => Ok(Query::True),
            Some(Token::Atom(atom)) if atom == "#f" => Ok(Query::False),
            Some(Token::Open) => self.form(),
            Some(other) => Err(BackendError::InvalidQuery(format!(
                "Unexpected token {other:?}"
            ))),
            None => Err(BackendError::InvalidQuery("Empty expression".into())),
        }
    }

    fn form(&mut self) -> BackendResult<Query> {
        let op = match self.next() {
            Some(Token::Atom(op)) => op,
            other => {
                return Err(BackendError::InvalidQuery(format!(
                    "Expected operator, got {other:?}"
                )));
            }
        };

        let query = match op.as_str() {
            "and" => Query::And(self.exprs_until_close()?),
            "or" => Query::Or(self.exprs_until_close()?),
            "not" => Query::Not(Box::new(self.expr()?)),
            "uid?" => Query::Uid(self.string()?),
            "contains?" => {
                let field_name = self.string()?;
                let field = TextField::parse(&field_name).ok_or_else(|| {
                    BackendError::InvalidQuery(format!("Unknown field '{field_name}'"))
                })?;
                let text = self.string()?;
                Query::Contains { field, text }
            }
            "has-recurrences?" => Query::HasRecurrences,
            "has-alarms?" => Query::HasAlarms,
            "has-attachments?" => Query::HasAttachments,
            other => {
                return Err(BackendError::InvalidQuery(format!(
                    "Unknown function '{other}'"
                )));
            }
        };

        // and/or consume their own closing paren
        if !matches!(query, Query::And(_) | Query::Or(_)) {
            self.close()?;
        }
        Ok(query)
    }

    fn exprs_until_close(&mut self) -> BackendResult<Vec<Query>> {
        let mut parts = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Close) => {
                    self.pos += 1;
                    return Ok(parts);
                }
                Some(_) => parts.push(self.expr()?),
                None => return Err(BackendError::InvalidQuery("Missing ')'".into())),
            }
        }
    }

    fn string(&mut self) -> BackendResult<String> {
        match self.next() {
            Some(Token::Str(value)) => Ok(value),
            other => Err(BackendError::InvalidQuery(format!(
                "Expected string literal, got {other:?}"
            ))),
        }
    }

    fn close(&mut self) -> BackendResult<()> {
        match self.next() {
            Some(Token::Close) => Ok(()),
            other => Err(BackendError::InvalidQuery(format!(
                "Expected ')', got {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentKind, Property};

    fn event(uid: &str, summary: &str) -> Component {
        let mut c = Component::new(ComponentKind::Event);
        c.set_uid(uid);
        c.set_property("SUMMARY", summary);
        c
    }

    #[test]
    fn test_parse_nested_query() {
        let query =
            Query::parse(r#"(and (contains? "summary" "lunch") (not (uid? "skip-me")))"#).unwrap();

        assert!(query.matches(&event("a", "Team Lunch")));
        assert!(!query.matches(&event("skip-me", "Lunch")));
        assert!(!query.matches(&event("b", "Standup")));
    }

    #[test]
    fn test_contains_any_searches_all_text_fields() {
        let mut c = event("a", "Review");
        c.add_property(Property::new("LOCATION", "Room 4"));

        let query = Query::parse(r#"(contains? "any" "room")"#).unwrap();
        assert!(query.matches(&c));
    }

    #[test]
    fn test_constants() {
        let c = event("a", "x");
        assert!(Query::parse("#t").unwrap().matches(&c));
        assert!(!Query::parse("#f").unwrap().matches(&c));
        assert!(Query::parse("(or #f #t)").unwrap().matches(&c));
        assert!(Query::parse("(and)").unwrap().matches(&c));
    }

    #[test]
    fn test_display_parses_back() {
        let text = r#"(or (uid? "a") (contains? "location" "Berlin \"Mitte\"") (has-alarms?))"#;
        let query = Query::parse(text).unwrap();
        assert_eq!(Query::parse(&query.to_string()).unwrap(), query);
    }

    #[test]
    fn test_invalid_queries() {
        for text in ["", "(", "(frobnicate?)", r#"(contains? "nope" "x")"#, "#t #t", r#"(uid? "a""#] {
            let err = Query::parse(text).unwrap_err();
            assert!(
                matches!(err, BackendError::InvalidQuery(_)),
                "expected InvalidQuery for {text:?}, got {err:?}"
            );
        }
    }
}
