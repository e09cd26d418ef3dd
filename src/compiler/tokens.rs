//! Source positions and ranges.
//!
//! Every AST node and every diagnostic carries a `TextLocation` so that
//! errors emitted deep inside codegen can still point at the offending
//! source range.

use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CharPosition {
    pub line_number: i32,
    pub char_column: i32,
}

impl CharPosition {
    pub fn new(line_number: i32, char_column: i32) -> Self {
        Self {
            line_number,
            char_column,
        }
    }
}

/// A source range inside one file.
///
/// `scope` is the path of the source file the range belongs to. Ranges are
/// inclusive of `start_pos` and exclusive of `end_pos`.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct TextLocation {
    pub scope: PathBuf,
    pub start_pos: CharPosition,
    pub end_pos: CharPosition,
}

impl TextLocation {
    pub fn new(scope: PathBuf, start: CharPosition, end: CharPosition) -> Self {
        Self {
            scope,
            start_pos: start,
            end_pos: end,
        }
    }

    /// A location spanning a single line, used by synthesised nodes and
    /// tests where only the line number is meaningful.
    pub fn new_just_line(start: i32) -> Self {
        Self {
            scope: PathBuf::new(),
            start_pos: CharPosition {
                line_number: start,
                char_column: 0,
            },
            end_pos: CharPosition {
                line_number: start,
                char_column: 120,
            },
        }
    }

    /// Extend this range to cover `other` as well.
    pub fn merged_with(&self, other: &TextLocation) -> TextLocation {
        let start = if (other.start_pos.line_number, other.start_pos.char_column)
            < (self.start_pos.line_number, self.start_pos.char_column)
        {
            other.start_pos
        } else {
            self.start_pos
        };
        let end = if (other.end_pos.line_number, other.end_pos.char_column)
            > (self.end_pos.line_number, self.end_pos.char_column)
        {
            other.end_pos
        } else {
            self.end_pos
        };
        TextLocation::new(self.scope.clone(), start, end)
    }
}
