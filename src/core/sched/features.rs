// src/core/sched/features.rs

//! Feature-expression parsing and evaluation.
//!
//! Expressions combine feature atoms with `&` and `|` at equal precedence,
//! evaluated left to right; parentheses are the only disambiguator. A
//! bracketed scope `[ ... ]` holds exclusive alternatives: the job must be
//! satisfied by the bracket's atoms without mixing nodes across alternatives
//! beyond their counts. Counts (`feature*N`) are mandatory inside brackets
//! and advisory outside.
//!
//! Evaluating an expression against a node yields two answers: whether the
//! node satisfies it with its *active* features, and whether it would after
//! a reboot into its *available* (changeable) features. A node that matches
//! only the second way can still be selected; selecting it schedules a
//! reboot.

use crate::core::errors::LodestarError;
use crate::core::types::bitmap::NodeBitmap;
use crate::core::types::node::Node;
use crate::core::state::tables::NodeTable;

/// Operator following an atom, in source order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureOp {
    And,
    Or,
    /// `&` inside a bracket scope: every counted alternative must be met.
    Xand,
    /// `|` inside a bracket scope: match one alternative.
    Mor,
    End,
}

/// One atom of a feature expression, with the operator that follows it.
#[derive(Clone, Debug)]
pub struct FeatureAtom {
    pub name: String,
    pub count: Option<u32>,
    pub op: FeatureOp,
    pub paren_depth: u8,
    pub bracket_depth: u8,
}

#[derive(Clone, Debug, Default)]
pub struct FeatureExpr {
    pub atoms: Vec<FeatureAtom>,
}

impl FeatureExpr {
    /// Parses an expression. Rejects unbalanced scopes, empty atoms,
    /// counts without a value, and counts missing inside brackets.
    pub fn parse(expr: &str) -> Result<Self, LodestarError> {
        let mut atoms: Vec<FeatureAtom> = Vec::new();
        let mut paren_depth = 0u8;
        let mut bracket_depth = 0u8;
        let mut name = String::new();
        let mut count_str: Option<String> = None;
        let bad =
            |msg: &str| LodestarError::InvalidRequest(format!("feature expression: {msg} '{expr}'"));

        let mut push_atom =
            |name: &mut String,
             count_str: &mut Option<String>,
             op: FeatureOp,
             paren_depth: u8,
             bracket_depth: u8,
             atoms: &mut Vec<FeatureAtom>|
             -> Result<(), LodestarError> {
                if name.is_empty() {
                    return Err(bad("empty feature atom"));
                }
                let count = match count_str.take() {
                    Some(s) => Some(s.parse::<u32>().map_err(|_| bad("bad count"))?),
                    None => None,
                };
                atoms.push(FeatureAtom {
                    name: std::mem::take(name),
                    count,
                    op,
                    paren_depth,
                    bracket_depth,
                });
                Ok(())
            };

        let mut chars = expr.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '[' => {
                    if bracket_depth > 0 {
                        return Err(bad("nested brackets"));
                    }
                    bracket_depth += 1;
                }
                ']' => {
                    if bracket_depth == 0 {
                        return Err(bad("unbalanced brackets"));
                    }
                    if !name.is_empty() {
                        push_atom(
                            &mut name,
                            &mut count_str,
                            // Operator is fixed up when the next token arrives.
                            FeatureOp::End,
                            paren_depth,
                            bracket_depth,
                            &mut atoms,
                        )?;
                    }
                    bracket_depth -= 1;
                }
                '(' => {
                    paren_depth += 1;
                }
                ')' => {
                    if paren_depth == 0 {
                        return Err(bad("unbalanced parentheses"));
                    }
                    if !name.is_empty() {
                        push_atom(
                            &mut name,
                            &mut count_str,
                            FeatureOp::End,
                            paren_depth,
                            bracket_depth,
                            &mut atoms,
                        )?;
                    }
                    paren_depth -= 1;
                }
                '&' | '|' => {
                    let op = match (c, bracket_depth > 0) {
                        ('&', true) => FeatureOp::Xand,
                        ('&', false) => FeatureOp::And,
                        ('|', true) => FeatureOp::Mor,
                        (_, false) => FeatureOp::Or,
                        _ => unreachable!(),
                    };
                    if !name.is_empty() {
                        push_atom(
                            &mut name,
                            &mut count_str,
                            op,
                            paren_depth,
                            bracket_depth,
                            &mut atoms,
                        )?;
                    } else {
                        // The atom was closed by ')' or ']'; patch its operator.
                        match atoms.last_mut() {
                            Some(last) if last.op == FeatureOp::End => last.op = op,
                            _ => return Err(bad("operator without operand")),
                        }
                    }
                }
                '*' => {
                    if name.is_empty() {
                        return Err(bad("count without feature"));
                    }
                    let mut digits = String::new();
                    while let Some(d) = chars.peek() {
                        if d.is_ascii_digit() {
                            digits.push(*d);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if digits.is_empty() {
                        return Err(bad("count without value"));
                    }
                    count_str = Some(digits);
                }
                c if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                    if count_str.is_some() {
                        return Err(bad("text after count"));
                    }
                    name.push(c);
                }
                c if c.is_whitespace() => return Err(bad("whitespace")),
                _ => return Err(bad("unexpected character")),
            }
        }
        if !name.is_empty() {
            push_atom(
                &mut name,
                &mut count_str,
                FeatureOp::End,
                paren_depth,
                bracket_depth,
                &mut atoms,
            )?;
        }
        if paren_depth != 0 || bracket_depth != 0 {
            return Err(bad("unbalanced scope"));
        }
        if atoms.is_empty() {
            return Err(bad("empty expression"));
        }
        if let Some(last) = atoms.last() {
            if last.op != FeatureOp::End {
                return Err(bad("trailing operator"));
            }
        }
        // Counts are mandatory inside brackets.
        for atom in &atoms {
            if atom.bracket_depth > 0 && atom.count.is_none() {
                return Err(bad("bracketed alternative without count"));
            }
        }
        Ok(Self { atoms })
    }

    /// The bracketed alternatives, in source order. Empty when the
    /// expression has no exclusive scope.
    pub fn alternatives(&self) -> Vec<&FeatureAtom> {
        self.atoms.iter().filter(|a| a.bracket_depth > 0).collect()
    }

    pub fn has_exclusive(&self) -> bool {
        self.atoms.iter().any(|a| a.bracket_depth > 0)
    }

    /// Whether the bracket scope combines alternatives with XAND, meaning
    /// every counted alternative must be satisfied simultaneously.
    pub fn has_xand(&self) -> bool {
        self.atoms.iter().any(|a| a.op == FeatureOp::Xand)
    }

    /// Bitmask of bracket alternatives this node can satisfy (by available
    /// features, so a reboot candidate still counts).
    pub fn alternative_mask(&self, node: &Node) -> u64 {
        let mut mask = 0u64;
        for (bit, atom) in self.alternatives().iter().enumerate() {
            if node.has_avail_feature(&atom.name) {
                mask |= 1 << bit;
            }
        }
        mask
    }

    /// Evaluates the expression against one node, left to right with equal
    /// precedence. Returns (matches with active features, matches with
    /// available features). Bracketed scopes behave as "any alternative" at
    /// the single-node level; the per-alternative counts are enforced by the
    /// selection loop.
    pub fn eval(&self, node: &Node) -> (bool, bool) {
        (
            self.eval_with(|name| node.has_active_feature(name)),
            self.eval_with(|name| node.has_avail_feature(name)),
        )
    }

    fn eval_with(&self, has: impl Fn(&str) -> bool) -> bool {
        // One accumulator per paren depth; closed scopes merge into their
        // parent before the following atom is applied, preserving strict
        // left-to-right evaluation at equal precedence.
        let mut result: Option<bool> = None;
        let mut pending_op = FeatureOp::And;
        let mut depth_stack: Vec<(Option<bool>, FeatureOp)> = Vec::new();
        let mut current_depth = 0u8;
        let mut bracket_accum: Option<bool> = None;

        let apply = |acc: Option<bool>, op: FeatureOp, val: bool| -> bool {
            match (acc, op) {
                (None, _) => val,
                (Some(a), FeatureOp::And | FeatureOp::Xand) => a && val,
                (Some(a), FeatureOp::Or | FeatureOp::Mor) => a || val,
                (Some(a), FeatureOp::End) => a && val,
            }
        };

        for atom in &self.atoms {
            while current_depth < atom.paren_depth {
                depth_stack.push((result, pending_op));
                result = None;
                pending_op = FeatureOp::And;
                current_depth += 1;
            }
            while current_depth > atom.paren_depth {
                let inner = result.unwrap_or(false);
                let (outer, outer_op) = depth_stack.pop().unwrap_or((None, FeatureOp::And));
                result = Some(apply(outer, outer_op, inner));
                current_depth -= 1;
            }

            let val = has(&atom.name);
            if atom.bracket_depth > 0 {
                // At the single-node level a bracket matches if the node has
                // any alternative; cross-node counts (XAND and MOR alike) are
                // enforced by the selection loop, not here.
                bracket_accum = Some(match bracket_accum {
                    None => val,
                    Some(a) => a || val,
                });
                if !matches!(atom.op, FeatureOp::Xand | FeatureOp::Mor) {
                    let bracket_val = bracket_accum.take().unwrap_or(false);
                    result = Some(apply(result, pending_op, bracket_val));
                    pending_op = atom.op;
                }
            } else {
                result = Some(apply(result, pending_op, val));
                pending_op = atom.op;
            }
        }
        while current_depth > 0 {
            let inner = result.unwrap_or(false);
            let (outer, outer_op) = depth_stack.pop().unwrap_or((None, FeatureOp::And));
            result = Some(apply(outer, outer_op, inner));
            current_depth -= 1;
        }
        if let Some(val) = bracket_accum {
            result = Some(apply(result, pending_op, val));
        }
        result.unwrap_or(false)
    }
}

/// Filters `bitmap` down to the nodes whose available features satisfy the
/// job's expression. Idempotent: the surviving nodes still satisfy the
/// expression on a second pass.
pub fn valid_feature_counts(
    expr: &FeatureExpr,
    nodes: &NodeTable,
    bitmap: &NodeBitmap,
) -> NodeBitmap {
    let mut out = bitmap.clone();
    for idx in bitmap.iter_ones() {
        let keep = nodes
            .get(idx as u32)
            .map(|n| expr.eval(n).1)
            .unwrap_or(false);
        if !keep {
            out.clear(idx);
        }
    }
    out
}
