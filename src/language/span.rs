use miette::SourceSpan;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn union(self, other: Span) -> Span {
        Span::new(self.start.min(other.start), self.end.max(other.end))
    }

    pub fn to_source_span(self) -> SourceSpan {
        (self.start, self.len()).into()
    }
}

#[derive(Clone, Debug)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

/// Resolved position of a node: byte offset plus 1-based line and column.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Location {
    pub span: Span,
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn offset(&self) -> usize {
        self.span.start
    }
}

/// Byte offsets of every line start, used to turn spans into line/column pairs.
#[derive(Clone, Debug)]
pub struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let mut starts = vec![0];
        for (idx, ch) in source.char_indices() {
            if ch == '\n' {
                starts.push(idx + 1);
            }
        }
        Self { starts }
    }

    pub fn locate(&self, span: Span) -> Location {
        let line_idx = match self.starts.binary_search(&span.start) {
            Ok(idx) => idx,
            Err(idx) => idx.saturating_sub(1),
        };
        let column = span.start - self.starts[line_idx] + 1;
        Location {
            span,
            line: line_idx as u32 + 1,
            column: column as u32,
        }
    }

    pub fn line_count(&self) -> usize {
        self.starts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_reports_one_based_line_and_column() {
        let index = LineIndex::new("var a = 1;\n  var b = 2;\n");
        let loc = index.locate(Span::new(13, 16));
        assert_eq!(loc.line, 2);
        assert_eq!(loc.column, 3);
        let first = index.locate(Span::new(0, 3));
        assert_eq!((first.line, first.column), (1, 1));
    }
}
