//! Position-based operational transformation for rich-text content.
//!
//! Operations address the document by character offset. Attribute bundles
//! are carried through transformation untouched; only positions and lengths
//! participate.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Open-ended formatting attributes attached to an insert, passed through
/// the transformer as an opaque bundle.
pub type Attributes = serde_json::Map<String, Value>;

/// Maximum document size after an accepted edit, in characters.
pub const MAX_CONTENT_LEN: usize = 256 * 1024;

/// A single edit primitive over document content.
///
/// Positions and lengths are character offsets. A sequence of operations
/// over the same base document is applied left to right, each operation
/// addressing the result of the previous one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Splice `content` into the document at `position`.
    Insert {
        position: usize,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attributes: Option<Attributes>,
    },
    /// Remove `length` characters starting at `position`.
    Delete { position: usize, length: usize },
    /// Leave `length` characters untouched.
    Retain { length: usize },
}

impl Operation {
    /// Shorthand constructor for an unattributed insert.
    pub fn insert(position: usize, content: impl Into<String>) -> Self {
        Self::Insert {
            position,
            content: content.into(),
            attributes: None,
        }
    }

    /// Shorthand constructor for a delete.
    pub fn delete(position: usize, length: usize) -> Self {
        Self::Delete { position, length }
    }
}

/// Structural violations in a submitted operation set.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OpError {
    /// A delete or retain with a zero length.
    #[error("operation length must be positive")]
    ZeroLength,
    /// An insert with no content.
    #[error("insert content must not be empty")]
    EmptyInsert,
    /// An insert position beyond the end of the content.
    #[error("insert position {position} is beyond content length {len}")]
    OutOfBounds { position: usize, len: usize },
    /// A delete range extending past the end of the content.
    #[error("delete range {position}..{end} exceeds content length {len}")]
    RangeOutOfBounds {
        position: usize,
        end: usize,
        len: usize,
    },
}

/// Checks the invariants that hold independent of any document state.
pub fn validate(ops: &[Operation]) -> Result<(), OpError> {
    for op in ops {
        match op {
            Operation::Insert { content, .. } if content.is_empty() => {
                return Err(OpError::EmptyInsert);
            }
            Operation::Delete { length: 0, .. } | Operation::Retain { length: 0 } => {
                return Err(OpError::ZeroLength);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Checks each operation's bounds against a document of `len` characters,
/// tracking the length as the sequence applies left to right.
pub fn check_bounds(mut len: usize, ops: &[Operation]) -> Result<(), OpError> {
    for op in ops {
        match op {
            Operation::Insert {
                position, content, ..
            } => {
                if *position > len {
                    return Err(OpError::OutOfBounds {
                        position: *position,
                        len,
                    });
                }
                len += content.chars().count();
            }
            Operation::Delete { position, length } => {
                if position + length > len {
                    return Err(OpError::RangeOutOfBounds {
                        position: *position,
                        end: position + length,
                        len,
                    });
                }
                len -= length;
            }
            Operation::Retain { .. } => {}
        }
    }
    Ok(())
}

/// Computes the content length after applying `ops` to a document of `len`
/// characters, with the same clamping as [`apply`].
pub fn result_len(mut len: usize, ops: &[Operation]) -> usize {
    for op in ops {
        match op {
            Operation::Insert { content, .. } => len += content.chars().count(),
            Operation::Delete { position, length } => {
                let start = (*position).min(len);
                let end = (position + length).min(len);
                len -= end - start;
            }
            Operation::Retain { .. } => {}
        }
    }
    len
}

/// Applies `ops` to `content` in order. Positions are clamped to the
/// current content bounds so a transformed set can never panic the engine.
pub fn apply(content: &mut String, ops: &[Operation]) {
    for op in ops {
        match op {
            Operation::Insert {
                position,
                content: text,
                ..
            } => {
                let at = byte_index(content, *position);
                content.insert_str(at, text);
            }
            Operation::Delete { position, length } => {
                let chars = content.chars().count();
                let start = (*position).min(chars);
                let end = (position + length).min(chars);
                let start = byte_index(content, start);
                let end = byte_index(content, end);
                content.replace_range(start..end, "");
            }
            Operation::Retain { .. } => {}
        }
    }
}

/// Byte offset of the `pos`-th character, clamped to the end of `s`.
fn byte_index(s: &str, pos: usize) -> usize {
    s.char_indices().nth(pos).map(|(i, _)| i).unwrap_or(s.len())
}

/// Transforms each element of `ops` against each element of `concurrent`
/// in order, so that the result applies after `concurrent` with the same
/// intent. The concurrent side wins position ties (it is already part of
/// the authoritative sequence). Operations emptied by the transform are
/// dropped.
pub fn transform_against(ops: &[Operation], concurrent: &[Operation]) -> Vec<Operation> {
    let mut current = ops.to_vec();
    for b in concurrent {
        let mut next = Vec::with_capacity(current.len());
        for a in &current {
            transform_op(a, b, false, &mut next);
        }
        current = next;
    }
    current
}

/// Pairwise transform of `a` to apply after the concurrent `b`.
///
/// `a_wins_ties` selects which side keeps its position when two inserts
/// land at the same offset. A delete can split in two when a concurrent
/// insert lands strictly inside its range, so results go through `out`.
pub fn transform_op(a: &Operation, b: &Operation, a_wins_ties: bool, out: &mut Vec<Operation>) {
    match (a, b) {
        (_, Operation::Retain { .. }) | (Operation::Retain { .. }, _) => out.push(a.clone()),

        (
            Operation::Insert {
                position: pa,
                content,
                attributes,
            },
            Operation::Insert {
                position: pb,
                content: cb,
                ..
            },
        ) => {
            let shift = if *pb < *pa || (*pb == *pa && !a_wins_ties) {
                cb.chars().count()
            } else {
                0
            };
            out.push(Operation::Insert {
                position: pa + shift,
                content: content.clone(),
                attributes: attributes.clone(),
            });
        }

        (
            Operation::Insert {
                position: pa,
                content,
                attributes,
            },
            Operation::Delete {
                position: pb,
                length: lb,
            },
        ) => {
            let position = if *pb < *pa { pa - (pa - pb).min(*lb) } else { *pa };
            out.push(Operation::Insert {
                position,
                content: content.clone(),
                attributes: attributes.clone(),
            });
        }

        (
            Operation::Delete {
                position: pa,
                length: la,
            },
            Operation::Insert {
                position: pb,
                content: cb,
                ..
            },
        ) => {
            let inserted = cb.chars().count();
            if *pb <= *pa {
                out.push(Operation::delete(pa + inserted, *la));
            } else if *pb < pa + la {
                // The concurrent insert landed strictly inside the deleted
                // range. Split the delete around it so the inserted text
                // survives on every replica.
                let head = pb - pa;
                out.push(Operation::delete(*pa, head));
                out.push(Operation::delete(pa + inserted, la - head));
            } else {
                out.push(a.clone());
            }
        }

        (
            Operation::Delete {
                position: pa,
                length: la,
            },
            Operation::Delete {
                position: pb,
                length: lb,
            },
        ) => {
            let a_end = pa + la;
            let b_end = pb + lb;
            if b_end <= *pa {
                out.push(Operation::delete(pa - lb, *la));
            } else if *pb >= a_end {
                out.push(a.clone());
            } else {
                let overlap = a_end.min(b_end) - (*pa).max(*pb);
                let length = la - overlap;
                if length > 0 {
                    out.push(Operation::delete((*pa).min(*pb), length));
                }
            }
        }
    }
}

/// Merges adjacent operations that express one contiguous edit: an insert
/// directly continuing the previous insert, or a delete at the same
/// position as the previous delete. The merged set has the same effect as
/// the original.
pub fn compose(ops: Vec<Operation>) -> Vec<Operation> {
    let mut out: Vec<Operation> = Vec::with_capacity(ops.len());
    for op in ops {
        match (out.last_mut(), op) {
            (
                Some(Operation::Insert {
                    position,
                    content,
                    attributes,
                }),
                Operation::Insert {
                    position: p2,
                    content: c2,
                    attributes: a2,
                },
            ) if p2 == *position + content.chars().count() && *attributes == a2 => {
                content.push_str(&c2);
            }
            (
                Some(Operation::Delete { position, length }),
                Operation::Delete {
                    position: p2,
                    length: l2,
                },
            ) if p2 == *position => {
                *length += l2;
            }
            (_, op) => out.push(op),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn applied(base: &str, ops: &[Operation]) -> String {
        let mut content = base.to_string();
        apply(&mut content, ops);
        content
    }

    /// Applies `a` then `b'` on one side and `b` then `a'` on the other,
    /// asserting both replicas end up with identical content.
    fn converges(base: &str, a: Operation, b: Operation) -> String {
        let mut a_wins = Vec::new();
        transform_op(&a, &b, true, &mut a_wins);
        let mut b_loses = Vec::new();
        transform_op(&b, &a, false, &mut b_loses);

        let left = applied(&applied(base, &[a]), &b_loses);
        let right = applied(&applied(base, &[b]), &a_wins);
        assert_eq!(left, right, "divergence from {base:?}");
        left
    }

    #[test]
    fn insert_insert_tie_breaks_by_priority() {
        let final_text = converges(
            "Hello World",
            Operation::insert(5, " there"),
            Operation::insert(5, "!"),
        );
        assert_eq!(final_text, "Hello there! World");
    }

    #[test]
    fn insert_shifts_right_of_earlier_insert() {
        let out = transform_against(&[Operation::insert(5, "!")], &[Operation::insert(0, "ab")]);
        assert_eq!(out, vec![Operation::insert(7, "!")]);
    }

    #[test]
    fn insert_unaffected_by_later_insert() {
        let out = transform_against(&[Operation::insert(1, "x")], &[Operation::insert(5, "yy")]);
        assert_eq!(out, vec![Operation::insert(1, "x")]);
    }

    #[test]
    fn insert_clamps_into_concurrent_delete() {
        // Inserting at 3 after "BCD" was deleted lands at the deletion point.
        let out = transform_against(&[Operation::insert(3, "X")], &[Operation::delete(1, 3)]);
        assert_eq!(out, vec![Operation::insert(1, "X")]);
    }

    #[test]
    fn delete_splits_around_concurrent_insert() {
        let out = transform_against(&[Operation::delete(1, 3)], &[Operation::insert(3, "X")]);
        assert_eq!(out, vec![Operation::delete(1, 2), Operation::delete(2, 1)]);
        assert_eq!(applied("ABCXDEF", &out), "AXEF");
    }

    #[test]
    fn insert_delete_pairs_converge() {
        let final_text = converges("ABCDEF", Operation::insert(3, "X"), Operation::delete(1, 3));
        assert!(final_text == "AXEF" || final_text == "AEFX", "{final_text}");
    }

    #[test]
    fn delete_delete_disjoint() {
        let out = transform_against(&[Operation::delete(4, 2)], &[Operation::delete(0, 2)]);
        assert_eq!(out, vec![Operation::delete(2, 2)]);

        let out = transform_against(&[Operation::delete(0, 2)], &[Operation::delete(4, 2)]);
        assert_eq!(out, vec![Operation::delete(0, 2)]);
    }

    #[test]
    fn delete_delete_partial_overlap() {
        // a deletes [3, 6), b deletes [1, 5): one character of a survives.
        let out = transform_against(&[Operation::delete(3, 3)], &[Operation::delete(1, 4)]);
        assert_eq!(out, vec![Operation::delete(1, 1)]);
        converges("abcdefgh", Operation::delete(3, 3), Operation::delete(1, 4));
    }

    #[test]
    fn delete_swallowed_by_concurrent_delete_is_dropped() {
        let out = transform_against(&[Operation::delete(2, 2)], &[Operation::delete(1, 5)]);
        assert!(out.is_empty());
    }

    #[test]
    fn identical_deletes_cancel() {
        let out = transform_against(&[Operation::delete(1, 3)], &[Operation::delete(1, 3)]);
        assert!(out.is_empty());
        converges("abcdef", Operation::delete(1, 3), Operation::delete(1, 3));
    }

    #[test]
    fn delete_contains_concurrent_delete() {
        converges("abcdefgh", Operation::delete(1, 5), Operation::delete(2, 2));
        converges("abcdefgh", Operation::delete(2, 2), Operation::delete(1, 5));
    }

    #[test]
    fn retain_passes_through() {
        let out = transform_against(
            &[Operation::Retain { length: 4 }],
            &[Operation::insert(0, "zz")],
        );
        assert_eq!(out, vec![Operation::Retain { length: 4 }]);

        let out = transform_against(
            &[Operation::insert(2, "x")],
            &[Operation::Retain { length: 9 }],
        );
        assert_eq!(out, vec![Operation::insert(2, "x")]);
    }

    #[test]
    fn three_way_inserts_preserve_all_content() {
        // Three clients each insert ten characters at position zero against
        // the same empty base; every character must survive.
        let sets = [
            vec![Operation::insert(0, "aaaaaaaaaa")],
            vec![Operation::insert(0, "bbbbbbbbbb")],
            vec![Operation::insert(0, "cccccccccc")],
        ];
        let mut content = String::new();
        let mut history: Vec<Vec<Operation>> = Vec::new();
        for set in &sets {
            let mut transformed = set.clone();
            for prior in &history {
                transformed = transform_against(&transformed, prior);
            }
            apply(&mut content, &transformed);
            history.push(transformed);
        }
        assert_eq!(content.chars().count(), 30);
        for needle in ["aaaaaaaaaa", "bbbbbbbbbb", "cccccccccc"] {
            assert!(content.contains(needle), "{content}");
        }
    }

    #[test]
    fn compose_merges_contiguous_inserts() {
        let ops = vec![Operation::insert(0, "ab"), Operation::insert(2, "cd")];
        assert_eq!(compose(ops), vec![Operation::insert(0, "abcd")]);
    }

    #[test]
    fn compose_merges_stacked_deletes() {
        let ops = vec![Operation::delete(3, 2), Operation::delete(3, 1)];
        assert_eq!(compose(ops), vec![Operation::delete(3, 3)]);
    }

    #[test]
    fn compose_preserves_effect() {
        let cases: Vec<Vec<Operation>> = vec![
            vec![Operation::insert(0, "ab"), Operation::insert(2, "cd")],
            vec![Operation::delete(1, 2), Operation::delete(1, 2)],
            vec![
                Operation::insert(0, "xy"),
                Operation::insert(2, "z"),
                Operation::delete(0, 1),
            ],
            vec![
                Operation::insert(3, "q"),
                Operation::Retain { length: 2 },
                Operation::insert(1, "r"),
            ],
        ];
        for ops in cases {
            let plain = applied("abcdef", &ops);
            let composed = applied("abcdef", &compose(ops.clone()));
            assert_eq!(plain, composed, "{ops:?}");
        }
    }

    #[test]
    fn compose_keeps_distinct_attribute_runs_apart() {
        let mut bold = Attributes::new();
        bold.insert("bold".into(), serde_json::Value::Bool(true));
        let ops = vec![
            Operation::insert(0, "ab"),
            Operation::Insert {
                position: 2,
                content: "cd".into(),
                attributes: Some(bold),
            },
        ];
        assert_eq!(compose(ops.clone()).len(), 2);
    }

    #[test]
    fn apply_clamps_out_of_range() {
        let mut content = "abc".to_string();
        apply(&mut content, &[Operation::insert(99, "!")]);
        assert_eq!(content, "abc!");
        apply(&mut content, &[Operation::delete(2, 99)]);
        assert_eq!(content, "ab");
    }

    #[test]
    fn apply_splices_on_character_boundaries() {
        let mut content = "héllo🦀".to_string();
        apply(&mut content, &[Operation::insert(2, "x")]);
        assert_eq!(content, "héxllo🦀");
        apply(&mut content, &[Operation::delete(1, 2)]);
        assert_eq!(content, "hllo🦀");
        apply(&mut content, &[Operation::delete(3, 1)]);
        assert_eq!(content, "hll");
    }

    #[test]
    fn bounds_are_checked_sequentially() {
        assert!(check_bounds(3, &[Operation::insert(3, "x")]).is_ok());
        assert_eq!(
            check_bounds(3, &[Operation::insert(4, "x")]),
            Err(OpError::OutOfBounds { position: 4, len: 3 })
        );
        // The first insert grows the document enough for the second.
        assert!(
            check_bounds(
                0,
                &[Operation::insert(0, "abcd"), Operation::delete(1, 3)]
            )
            .is_ok()
        );
        assert_eq!(
            check_bounds(2, &[Operation::delete(1, 2)]),
            Err(OpError::RangeOutOfBounds {
                position: 1,
                end: 3,
                len: 2
            })
        );
    }

    #[test]
    fn validation_rejects_degenerate_operations() {
        assert_eq!(
            validate(&[Operation::insert(0, "")]),
            Err(OpError::EmptyInsert)
        );
        assert_eq!(validate(&[Operation::delete(0, 0)]), Err(OpError::ZeroLength));
        assert_eq!(
            validate(&[Operation::Retain { length: 0 }]),
            Err(OpError::ZeroLength)
        );
        assert!(validate(&[Operation::insert(0, "a"), Operation::delete(0, 1)]).is_ok());
    }

    #[test]
    fn wire_format_round_trips() {
        let mut attrs = Attributes::new();
        attrs.insert("bold".into(), serde_json::Value::Bool(true));
        let ops = vec![
            Operation::Insert {
                position: 5,
                content: " there".into(),
                attributes: Some(attrs),
            },
            Operation::delete(0, 2),
            Operation::Retain { length: 7 },
        ];
        let json = serde_json::to_string(&ops).unwrap();
        assert!(json.contains("\"insert\""), "{json}");
        assert!(json.contains("\"bold\":true"), "{json}");
        let back: Vec<Operation> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ops);
    }
}
