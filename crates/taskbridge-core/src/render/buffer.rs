//! Multi-part text buffer
//!
//! Holds the markdown produced so far, already split into parts whose
//! rendered form fits the per-message budget. Each part remembers the
//! converter state it starts from (the source of a block left open by the
//! part before it), so parts render independently.
//!
//! ```text
//!   source: "....................|..............|......"
//!            part 0               part 1         part 2 (current)
//!            carry = clean        carry = [Pre]  carry = clean
//! ```
//!
//! Concatenating the sources of every part gives back exactly the text that
//! was pushed.

use super::markup::{self, Carry, Flavor};

/// One chat message worth of source text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Part {
    carry_in: Carry,
    source: String,
}

impl Part {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn render(&self, flavor: Flavor) -> String {
        markup::render_text(flavor, &self.carry_in, &self.source)
    }

    fn rendered_len_with(&self, extra: &str) -> usize {
        let mut candidate = String::with_capacity(self.source.len() + extra.len());
        candidate.push_str(&self.source);
        candidate.push_str(extra);
        markup::render_text(Flavor::Html, &self.carry_in, &candidate).chars().count()
    }
}

#[derive(Debug, Clone)]
pub struct RenderBuffer {
    parts: Vec<Part>,
    budget: usize,
}

impl RenderBuffer {
    /// `budget` is the maximum rendered length of one part's body
    pub fn new(budget: usize) -> Self {
        Self {
            parts: vec![Part::default()],
            budget: budget.max(1),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| p.source.is_empty())
    }

    /// Everything pushed so far
    pub fn source(&self) -> String {
        self.parts.iter().map(|p| p.source.as_str()).collect()
    }

    pub fn ends_with_newline(&self) -> bool {
        self.parts
            .iter()
            .rev()
            .find(|p| !p.source.is_empty())
            .is_none_or(|p| p.source.ends_with('\n'))
    }

    /// Append text, opening new parts when the current one would overflow
    ///
    /// Returns how many new parts were opened.
    pub fn push(&mut self, text: &str) -> usize {
        let mut opened = 0;
        let mut rest = text;

        while !rest.is_empty() {
            let Some(current) = self.parts.last_mut() else {
                self.parts.push(Part::default());
                continue;
            };

            if current.rendered_len_with(rest) <= self.budget {
                current.source.push_str(rest);
                break;
            }

            let mut cut = split_point(current, rest, self.budget);
            if cut == 0 && current.source.is_empty() {
                // Budget too small for even one character; take one anyway to make progress
                cut = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
            }
            current.source.push_str(&rest[..cut]);
            rest = &rest[cut..];

            let carry_in = markup::carry_after(&current.carry_in, &current.source);
            self.parts.push(Part {
                carry_in,
                source: String::new(),
            });
            opened += 1;
        }

        opened
    }
}

/// Byte offset into `rest` of the longest prefix that still fits, snapped
/// back to a line or word boundary when one is available
fn split_point(part: &Part, rest: &str, budget: usize) -> usize {
    let offsets: Vec<usize> = rest
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(rest.len()))
        .collect();

    // offsets[lo] always fits, offsets[hi] never does
    let mut lo = 0;
    let mut hi = offsets.len() - 1;
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if part.rendered_len_with(&rest[..offsets[mid]]) <= budget {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let fit = offsets[lo];
    if fit == 0 {
        return 0;
    }

    let window = &rest[..fit];
    let snapped = window
        .rfind('\n')
        .map(|i| i + 1)
        .or_else(|| window.rfind(' ').map(|i| i + 1))
        .filter(|i| *i > 0);

    match snapped {
        // Don't leave a mostly-empty part just to land on a boundary
        Some(at) if at * 2 >= fit => {
            if part.rendered_len_with(&rest[..at]) <= budget {
                at
            } else {
                fit
            }
        }
        _ => fit,
    }
}
