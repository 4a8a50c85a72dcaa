//! # Model Formulas
//!
//! A small Wilkinson-style formula language: `response ~ term + term + ...`.
//!
//! - `a:b` is the interaction (product) of `a` and `b`.
//! - `a*b` crosses its operands: `a + b + a:b`, in that order.
//! - `0` or `- 1` removes the intercept; `1` keeps it explicitly.
//! - A factor is a column name, optionally wrapped as `log(x)`, `sqrt(x)`,
//!   `exp(x)` or `I(x^k)`.
//!
//! Transforms are applied to the raw column when the design matrix is built, so
//! counterfactual edits of `x` flow through every term that mentions it.

use itertools::Itertools;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FormulaError {
    #[error("Formula '{0}' must contain exactly one '~' separating response and predictors.")]
    MissingTilde(String),
    #[error("'{0}' is not a valid response name.")]
    InvalidResponse(String),
    #[error("Formula contains an empty term.")]
    EmptyTerm,
    #[error("Could not parse '{0}' as a variable or supported transform (log, sqrt, exp, I(x^k)).")]
    InvalidFactor(String),
    #[error("Only the intercept can be removed with '-', found '- {0}'.")]
    UnsupportedRemoval(String),
    #[error("Unbalanced parentheses in formula.")]
    UnbalancedParentheses,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Identity,
    Log,
    Sqrt,
    Exp,
    Power(i32),
}

/// One column, possibly transformed, inside a term.
#[derive(Debug, Clone, PartialEq)]
pub struct Factor {
    pub variable: String,
    pub transform: Transform,
}

impl Factor {
    #[inline]
    pub fn apply(&self, x: f64) -> f64 {
        match self.transform {
            Transform::Identity => x,
            Transform::Log => x.ln(),
            Transform::Sqrt => x.sqrt(),
            Transform::Exp => x.exp(),
            Transform::Power(k) => x.powi(k),
        }
    }

    pub fn label(&self) -> String {
        match self.transform {
            Transform::Identity => self.variable.clone(),
            Transform::Log => format!("log({})", self.variable),
            Transform::Sqrt => format!("sqrt({})", self.variable),
            Transform::Exp => format!("exp({})", self.variable),
            Transform::Power(k) => format!("I({}^{})", self.variable, k),
        }
    }
}

/// A product of factors; a main effect has exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct Term {
    pub factors: Vec<Factor>,
}

impl Term {
    pub fn label(&self) -> String {
        self.factors.iter().map(Factor::label).join(":")
    }

    fn canonical(&self) -> Vec<String> {
        self.factors.iter().map(Factor::label).sorted().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    pub response: String,
    pub intercept: bool,
    pub terms: Vec<Term>,
    source: String,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let (lhs, rhs) = match source.split('~').collect::<Vec<_>>().as_slice() {
            [lhs, rhs] => (lhs.trim(), rhs.trim()),
            _ => return Err(FormulaError::MissingTilde(source.to_string())),
        };
        if !is_identifier(lhs) {
            return Err(FormulaError::InvalidResponse(lhs.to_string()));
        }

        let mut intercept = true;
        let mut terms: Vec<Term> = Vec::new();
        for (negated, text) in split_top_level_signed(rhs)? {
            if negated {
                match text.as_str() {
                    "1" | "0" => intercept = false,
                    other => return Err(FormulaError::UnsupportedRemoval(other.to_string())),
                }
                continue;
            }
            match text.as_str() {
                "1" => intercept = true,
                "0" => intercept = false,
                _ => {
                    for term in expand_crossing(&text)? {
                        if !terms.iter().any(|t| t.canonical() == term.canonical()) {
                            terms.push(term);
                        }
                    }
                }
            }
        }

        Ok(Self {
            response: lhs.to_string(),
            intercept,
            terms,
            source: source.trim().to_string(),
        })
    }

    /// Distinct predictor columns referenced on the right-hand side, in order of
    /// first appearance.
    pub fn predictors(&self) -> Vec<String> {
        self.terms
            .iter()
            .flat_map(|t| t.factors.iter().map(|f| f.variable.clone()))
            .unique()
            .collect()
    }

    /// Names of the design matrix columns this formula produces.
    pub fn column_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.terms.len() + 1);
        if self.intercept {
            names.push("(Intercept)".to_string());
        }
        names.extend(self.terms.iter().map(Term::label));
        names
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Formula::parse(s)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Splits on `+`/`-` outside parentheses. Returns `(negated, text)` pairs.
fn split_top_level_signed(rhs: &str) -> Result<Vec<(bool, String)>, FormulaError> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    let mut negated = false;

    for c in rhs.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FormulaError::UnbalancedParentheses);
                }
                current.push(c);
            }
            '+' | '-' if depth == 0 => {
                let text = current.trim().to_string();
                if !text.is_empty() {
                    parts.push((negated, text));
                } else if !parts.is_empty() || negated {
                    return Err(FormulaError::EmptyTerm);
                }
                current.clear();
                negated = c == '-';
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return Err(FormulaError::UnbalancedParentheses);
    }
    let text = current.trim().to_string();
    if text.is_empty() {
        return Err(FormulaError::EmptyTerm);
    }
    parts.push((negated, text));
    Ok(parts)
}

fn split_top_level(text: &str, separator: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if c == separator && depth == 0 {
            parts.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
    }
    parts.push(current.trim().to_string());
    parts
}

/// `a*b:c*d` → groups `[a]`, `[b, c]`, `[d]`, crossed in R order: every
/// non-empty subset of groups, by size, then lexicographically.
fn expand_crossing(text: &str) -> Result<Vec<Term>, FormulaError> {
    let groups = split_top_level(text, '*')
        .into_iter()
        .map(|group| {
            split_top_level(&group, ':')
                .iter()
                .map(|factor| parse_factor(factor))
                .collect::<Result<Vec<Factor>, FormulaError>>()
        })
        .collect::<Result<Vec<Vec<Factor>>, FormulaError>>()?;

    let terms = (1..=groups.len())
        .flat_map(|size| (0..groups.len()).combinations(size))
        .map(|subset| Term {
            factors: subset
                .into_iter()
                .flat_map(|g| groups[g].iter().cloned())
                .collect(),
        })
        .collect();
    Ok(terms)
}

fn parse_factor(text: &str) -> Result<Factor, FormulaError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(FormulaError::EmptyTerm);
    }
    if is_identifier(text) {
        return Ok(Factor {
            variable: text.to_string(),
            transform: Transform::Identity,
        });
    }

    let invalid = || FormulaError::InvalidFactor(text.to_string());
    let open = text.find('(').ok_or_else(invalid)?;
    if !text.ends_with(')') {
        return Err(invalid());
    }
    let function = text[..open].trim();
    let inner = text[open + 1..text.len() - 1].trim();

    let (variable, transform) = match function {
        "log" => (inner, Transform::Log),
        "sqrt" => (inner, Transform::Sqrt),
        "exp" => (inner, Transform::Exp),
        "I" => {
            let (base, power) = inner.split_once('^').ok_or_else(invalid)?;
            let power: i32 = power.trim().parse().map_err(|_| invalid())?;
            (base.trim(), Transform::Power(power))
        }
        _ => return Err(invalid()),
    };
    if !is_identifier(variable) {
        return Err(invalid());
    }
    Ok(Factor {
        variable: variable.to_string(),
        transform,
    })
}
