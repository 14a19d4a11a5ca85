//! Filter-expression parser using nom.
//!
//! Parses the compact filter syntax the CLI accepts into a [`Where`].
//!
//! # Syntax Overview
//!
//! ```text
//! active=true & age>=18 & role=admin|role=mod & name~'bo'
//! ─────┬───── ───┬───── ─────────┬────────── ─────┬─────
//!      │         │               │                └── ILIKE '%bo%'
//!      │         │               └── OR group
//!      │         └── comparison
//!      └── equality
//! ```
//!
//! Groups separated by `&` are ANDed; conditions inside a group separated by
//! `|` are ORed. Values are `null`, `true`/`false`, numbers, `'quoted'`
//! strings or bare words.

use nom::{
    IResult,
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, value},
    multi::separated_list1,
    sequence::{delimited, tuple},
};

use crate::ast::{Clause, Cond, Value, Where};
use crate::error::{AdapterError, AdapterResult};

/// Parse a complete filter expression. An empty string matches every row.
pub fn parse_filter(input: &str) -> AdapterResult<Where> {
    let input = input.trim();
    if input.is_empty() {
        return Ok(Where::new());
    }
    match parse_groups(input) {
        Ok(("", groups)) => Ok(build_where(groups)),
        Ok((remaining, _)) => Err(AdapterError::validation(format!(
            "unexpected trailing content at {}: '{}'",
            input.len() - remaining.len(),
            remaining
        ))),
        Err(e) => Err(AdapterError::validation(format!(
            "cannot parse filter '{}': {:?}",
            input, e
        ))),
    }
}

fn build_where(groups: Vec<Vec<Clause>>) -> Where {
    let clauses = groups
        .into_iter()
        .map(|mut group| {
            if group.len() == 1 {
                group.remove(0)
            } else {
                Clause::Or(
                    group
                        .into_iter()
                        .map(|c| Where { clauses: vec![c] })
                        .collect(),
                )
            }
        })
        .collect();
    Where { clauses }
}

/// `group ( & group )*`
fn parse_groups(input: &str) -> IResult<&str, Vec<Vec<Clause>>> {
    separated_list1(ws(char('&')), parse_group)(input)
}

/// `condition ( | condition )*`
fn parse_group(input: &str) -> IResult<&str, Vec<Clause>> {
    separated_list1(ws(char('|')), parse_condition)(input)
}

fn ws<'a, O>(
    inner: impl FnMut(&'a str) -> IResult<&'a str, O>,
) -> impl FnMut(&'a str) -> IResult<&'a str, O> {
    delimited(multispace0, inner, multispace0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

/// Parse a single condition.
fn parse_condition(input: &str) -> IResult<&str, Clause> {
    let (input, (field, _, op, _, val)) = tuple((
        parse_identifier,
        multispace0,
        parse_operator,
        multispace0,
        parse_value,
    ))(input)?;

    let cond = match (op, val) {
        (Op::Eq, Value::Null) => Cond::IsNull,
        (Op::Ne, Value::Null) => Cond::NotNull,
        (Op::Eq, v) => Cond::Eq(v),
        (Op::Ne, v) => Cond::Ne(v),
        (Op::Gt, v) => Cond::Gt { value: v, inclusive: false },
        (Op::Gte, v) => Cond::Gt { value: v, inclusive: true },
        (Op::Lt, v) => Cond::Lt { value: v, inclusive: false },
        (Op::Lte, v) => Cond::Lt { value: v, inclusive: true },
        // A fuzzy match is on text, so `null` is the word itself.
        (Op::Like, Value::Null) => Cond::ILike("%null%".to_string()),
        (Op::Like, v) => Cond::ILike(format!("%{}%", v)),
    };
    Ok((
        input,
        Clause::Field {
            field: field.to_string(),
            cond,
        },
    ))
}

/// Parse an identifier (column name).
fn parse_identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_alphanumeric() || c == '_')(input)
}

fn parse_operator(input: &str) -> IResult<&str, Op> {
    alt((
        value(Op::Gte, tag(">=")),
        value(Op::Lte, tag("<=")),
        value(Op::Ne, tag("!=")),
        value(Op::Gt, char('>')),
        value(Op::Lt, char('<')),
        value(Op::Eq, char('=')),
        value(Op::Like, char('~')),
    ))(input)
}

/// Parse a value: a quoted string, or a bare token classified by shape.
fn parse_value(input: &str) -> IResult<&str, Value> {
    alt((parse_quoted_string, map(parse_bare, classify)))(input)
}

fn parse_bare(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != '&' && c != '|' && c != '\'')(input)
}

fn classify(token: &str) -> Value {
    match token {
        "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => {
            if let Ok(n) = token.parse::<i64>() {
                Value::Int(n)
            } else if let Some(f) = token
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite() && token.contains(|c: char| c.is_ascii_digit()))
            {
                Value::Float(f)
            } else {
                Value::String(token.to_string())
            }
        }
    }
}

/// Parse a quoted string. `''` inside the quotes is a literal quote.
fn parse_quoted_string(input: &str) -> IResult<&str, Value> {
    let (mut input, _) = char('\'')(input)?;
    let mut content = String::new();
    loop {
        let (rest, chunk) = take_while(|c| c != '\'')(input)?;
        content.push_str(chunk);
        let (rest, _) = char('\'')(rest)?;
        match rest.strip_prefix('\'') {
            Some(after) => {
                content.push('\'');
                input = after;
            }
            None => return Ok((rest, Value::String(content))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn field(name: &str, cond: Cond) -> Clause {
        Clause::Field {
            field: name.to_string(),
            cond,
        }
    }

    #[test]
    fn test_simple_equality() {
        let w = parse_filter("active=true").unwrap();
        assert_eq!(w.clauses, vec![field("active", Cond::Eq(Value::Bool(true)))]);
    }

    #[test]
    fn test_and_of_comparisons() {
        let w = parse_filter("age >= 18 & age<65 & score>2.5").unwrap();
        assert_eq!(
            w.clauses,
            vec![
                field("age", Cond::Gt { value: Value::Int(18), inclusive: true }),
                field("age", Cond::Lt { value: Value::Int(65), inclusive: false }),
                field("score", Cond::Gt { value: Value::Float(2.5), inclusive: false }),
            ]
        );
    }

    #[test]
    fn test_or_group_binds_inside_and() {
        let w = parse_filter("a=1 & b=2|c=3").unwrap();
        assert_eq!(
            w.clauses,
            vec![
                field("a", Cond::Eq(Value::Int(1))),
                Clause::Or(vec![
                    Where { clauses: vec![field("b", Cond::Eq(Value::Int(2)))] },
                    Where { clauses: vec![field("c", Cond::Eq(Value::Int(3)))] },
                ]),
            ]
        );
    }

    #[test]
    fn test_null_checks() {
        let w = parse_filter("deleted_at=null & owner!=null").unwrap();
        assert_eq!(
            w.clauses,
            vec![field("deleted_at", Cond::IsNull), field("owner", Cond::NotNull)]
        );
    }

    #[test]
    fn test_fuzzy_match() {
        let w = parse_filter("name~bo").unwrap();
        assert_eq!(w.clauses, vec![field("name", Cond::ILike("%bo%".to_string()))]);

        let w = parse_filter("note~null").unwrap();
        assert_eq!(w.clauses, vec![field("note", Cond::ILike("%null%".to_string()))]);
    }

    #[test]
    fn test_quoted_and_bare_strings() {
        let w = parse_filter("title='it''s a & b' & day=2024-03-01").unwrap();
        assert_eq!(
            w.clauses,
            vec![
                field("title", Cond::Eq(Value::from("it's a & b"))),
                field("day", Cond::Eq(Value::from("2024-03-01"))),
            ]
        );
    }

    #[test]
    fn test_empty_filter() {
        assert!(parse_filter("   ").unwrap().is_empty());
    }

    #[test]
    fn test_errors() {
        assert!(parse_filter("age").is_err());
        assert!(parse_filter("age=1 &").is_err());
        assert!(parse_filter("title='open").is_err());
        assert!(parse_filter("a=1 b=2").is_err());
    }
}
