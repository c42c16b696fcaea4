use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::component::ComponentRegistry;
use crate::entity::EntityId;
use crate::error::WorldError;
use crate::search::Filter;
use crate::store::FinalState;

/// Entity query language over component names:
///
/// ```text
/// Q := name | CONTAINS(name,…) | EXACT(name,…) | !Q | Q & Q | Q | Q | ( Q )
/// ```
///
/// `&` and `|` have no intrinsic precedence; expressions fold left-to-right
/// unless parenthesized. `!` binds to the immediately-following term or
/// parenthesized group. A bare name is shorthand for `CONTAINS(name)`.
#[derive(Debug, Clone, PartialEq)]
pub enum CqlError {
    Parse { position: usize, reason: String },
    UnknownComponent { name: String },
}

impl fmt::Display for CqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CqlError::Parse { position, reason } => {
                write!(f, "cql parse error at {position}: {reason}")
            }
            CqlError::UnknownComponent { name } => {
                write!(f, "cql references unknown component {name}")
            }
        }
    }
}

impl std::error::Error for CqlError {}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    LParen,
    RParen,
    Comma,
    Amp,
    Pipe,
    Bang,
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, CqlError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        let c = chars[index];
        match c {
            ' ' | '\t' | '\r' | '\n' => index += 1,
            '(' => {
                tokens.push((index, Token::LParen));
                index += 1;
            }
            ')' => {
                tokens.push((index, Token::RParen));
                index += 1;
            }
            ',' => {
                tokens.push((index, Token::Comma));
                index += 1;
            }
            '&' => {
                tokens.push((index, Token::Amp));
                index += 1;
            }
            '|' => {
                tokens.push((index, Token::Pipe));
                index += 1;
            }
            '!' => {
                tokens.push((index, Token::Bang));
                index += 1;
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let start = index;
                while index < chars.len()
                    && (chars[index].is_ascii_alphanumeric() || chars[index] == '_')
                {
                    index += 1;
                }
                let ident: String = chars[start..index].iter().collect();
                tokens.push((start, Token::Ident(ident)));
            }
            other => {
                return Err(CqlError::Parse {
                    position: index,
                    reason: format!("unexpected character {other:?}"),
                });
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<(usize, Token)>,
    cursor: usize,
    registry: &'a ComponentRegistry,
    input_len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(_, token)| token)
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let token = self.tokens.get(self.cursor).cloned();
        if token.is_some() {
            self.cursor += 1;
        }
        token
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map(|(position, _)| *position)
            .unwrap_or(self.input_len)
    }

    fn error(&self, reason: impl Into<String>) -> CqlError {
        CqlError::Parse {
            position: self.position(),
            reason: reason.into(),
        }
    }

    fn parse_expr(&mut self) -> Result<Filter, CqlError> {
        let mut left = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Amp) => {
                    self.next();
                    let right = self.parse_term()?;
                    left = Filter::and(left, right);
                }
                Some(Token::Pipe) => {
                    self.next();
                    let right = self.parse_term()?;
                    left = Filter::or(left, right);
                }
                _ => return Ok(left),
            }
        }
    }

    fn parse_term(&mut self) -> Result<Filter, CqlError> {
        match self.next() {
            Some((_, Token::Bang)) => Ok(Filter::not(self.parse_term()?)),
            Some((_, Token::LParen)) => {
                let inner = self.parse_expr()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    _ => Err(self.error("expected )")),
                }
            }
            Some((_, Token::Ident(ident))) => {
                let is_call = matches!(self.peek(), Some(Token::LParen));
                match (ident.as_str(), is_call) {
                    ("CONTAINS", true) => {
                        let ids = self.parse_name_list()?;
                        Ok(Filter::Contains(ids))
                    }
                    ("EXACT", true) => {
                        let ids = self.parse_name_list()?;
                        Ok(Filter::Exact(ids))
                    }
                    (name, false) => {
                        let id = self.resolve(name)?;
                        Ok(Filter::contains([id]))
                    }
                    (_, true) => Err(self.error(format!("unknown function {ident}"))),
                }
            }
            Some((position, token)) => Err(CqlError::Parse {
                position,
                reason: format!("unexpected token {token:?}"),
            }),
            None => Err(self.error("unexpected end of query")),
        }
    }

    fn parse_name_list(
        &mut self,
    ) -> Result<std::collections::BTreeSet<crate::component::ComponentId>, CqlError> {
        match self.next() {
            Some((_, Token::LParen)) => {}
            _ => return Err(self.error("expected (")),
        }
        let mut ids = std::collections::BTreeSet::new();
        loop {
            match self.next() {
                Some((_, Token::Ident(name))) => {
                    ids.insert(self.resolve(&name)?);
                }
                _ => return Err(self.error("expected component name")),
            }
            match self.next() {
                Some((_, Token::Comma)) => continue,
                Some((_, Token::RParen)) => return Ok(ids),
                _ => return Err(self.error("expected , or )")),
            }
        }
    }

    fn resolve(&self, name: &str) -> Result<crate::component::ComponentId, CqlError> {
        self.registry
            .id_by_name(name)
            .map_err(|_| CqlError::UnknownComponent {
                name: name.to_string(),
            })
    }
}

/// Parses a CQL expression into a [`Filter`], validating component names
/// against the registry.
pub fn parse(input: &str, registry: &ComponentRegistry) -> Result<Filter, CqlError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(CqlError::Parse {
            position: 0,
            reason: "empty query".to_string(),
        });
    }
    let mut parser = Parser {
        tokens,
        cursor: 0,
        registry,
        input_len: input.len(),
    };
    let filter = parser.parse_expr()?;
    if let Some((position, token)) = parser.tokens.get(parser.cursor) {
        return Err(CqlError::Parse {
            position: *position,
            reason: format!("unexpected trailing token {token:?}"),
        });
    }
    Ok(filter)
}

/// One matched entity with the values of its components, in component-id
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: EntityId,
    pub data: Vec<JsonValue>,
}

/// Evaluates a parsed filter over the committed state.
pub fn evaluate(
    filter: &Filter,
    state: &FinalState,
) -> Result<Vec<QueryResponse>, WorldError> {
    let mut responses = Vec::new();
    for entity in state.matching_entities(filter) {
        let components = state
            .entity_components(entity)
            .ok_or(WorldError::EntityNotFound { entity })?;
        let mut data = Vec::with_capacity(components.len());
        for component in components {
            data.push(
                state
                    .component_value(entity, *component)
                    .cloned()
                    .unwrap_or(JsonValue::Null),
            );
        }
        responses.push(QueryResponse { id: entity, data });
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ComponentRegistry {
        let mut registry = ComponentRegistry::new();
        registry.register("alpha").expect("register");
        registry.register("beta").expect("register");
        registry.register("gamma").expect("register");
        registry
    }

    fn set(ids: &[u32]) -> std::collections::BTreeSet<u32> {
        ids.iter().copied().collect()
    }

    #[test]
    fn parses_contains_and_exact() {
        let registry = registry();
        assert_eq!(
            parse("CONTAINS(alpha, beta)", &registry).expect("parse"),
            Filter::Contains(set(&[0, 1]))
        );
        assert_eq!(
            parse("EXACT(gamma)", &registry).expect("parse"),
            Filter::Exact(set(&[2]))
        );
    }

    #[test]
    fn bare_name_is_contains() {
        let registry = registry();
        assert_eq!(
            parse("alpha", &registry).expect("parse"),
            Filter::Contains(set(&[0]))
        );
    }

    #[test]
    fn folds_left_to_right_without_precedence() {
        let registry = registry();
        let parsed = parse("CONTAINS(alpha) & CONTAINS(beta) | CONTAINS(gamma)", &registry)
            .expect("parse");
        let expected = Filter::or(
            Filter::and(Filter::Contains(set(&[0])), Filter::Contains(set(&[1]))),
            Filter::Contains(set(&[2])),
        );
        assert_eq!(parsed, expected);
    }

    #[test]
    fn parentheses_override_fold_order() {
        let registry = registry();
        let parsed = parse("CONTAINS(alpha) & (CONTAINS(beta) | CONTAINS(gamma))", &registry)
            .expect("parse");
        let expected = Filter::and(
            Filter::Contains(set(&[0])),
            Filter::or(Filter::Contains(set(&[1])), Filter::Contains(set(&[2]))),
        );
        assert_eq!(parsed, expected);
    }

    #[test]
    fn bang_binds_to_following_term() {
        let registry = registry();
        let parsed = parse("!CONTAINS(alpha) & CONTAINS(beta)", &registry).expect("parse");
        let expected = Filter::and(
            Filter::not(Filter::Contains(set(&[0]))),
            Filter::Contains(set(&[1])),
        );
        assert_eq!(parsed, expected);

        let parsed = parse("!(CONTAINS(alpha) | CONTAINS(beta))", &registry).expect("parse");
        let expected = Filter::not(Filter::or(
            Filter::Contains(set(&[0])),
            Filter::Contains(set(&[1])),
        ));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn unknown_component_is_a_validation_error() {
        let registry = registry();
        assert_eq!(
            parse("CONTAINS(delta)", &registry),
            Err(CqlError::UnknownComponent {
                name: "delta".to_string()
            })
        );
    }

    #[test]
    fn malformed_queries_fail_to_parse() {
        let registry = registry();
        assert!(matches!(
            parse("CONTAINS(alpha", &registry),
            Err(CqlError::Parse { .. })
        ));
        assert!(matches!(parse("", &registry), Err(CqlError::Parse { .. })));
        assert!(matches!(
            parse("& alpha", &registry),
            Err(CqlError::Parse { .. })
        ));
        assert!(matches!(
            parse("alpha beta", &registry),
            Err(CqlError::Parse { .. })
        ));
    }
}
