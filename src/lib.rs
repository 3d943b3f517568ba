//! Bytecode-compiled regular expressions with a threaded NFA virtual
//! machine.
//!
//! Based on Russ Cox's article <https://swtch.com/~rsc/regexp/regexp2.html>
//! ("Regular Expression Matching: the Virtual Machine Approach"): a pattern
//! is parsed into an AST, lowered to a flat bytecode program, and executed
//! by a Pike-style VM that advances a priority-ordered list of virtual
//! threads over the subject one codepoint at a time, so that every viable
//! way of matching is explored breadth-first in a single pass.
//!
//! # Architecture
//!
//! The pipeline is:
//!
//! ```text
//! pattern bytes ──Parser──> ParsedRegex (AST + range table)
//!               ──Compiler──> CompiledRegex (bytecode + save slots)
//!               ──ThreadedRegexVm──> matched? + capture offsets
//! ```
//!
//! ## Threads and priority
//!
//! A VM thread is an instruction pointer plus one save slot per capture
//! boundary.  The thread list is ordered by match priority: earlier index
//! wins ties.  A `SplitPrioritizeParent` instruction inserts the
//! alternative *after* the current thread (the current path stays
//! preferred); `SplitPrioritizeChild` inserts the fall-through path after
//! the current thread and redirects the current thread to the split
//! target, which keeps the repeat-again path of an unbounded quantifier
//! preferred (greedy matching).
//!
//! ## Duplicate collapse
//!
//! At most one live thread may occupy a given parked instruction address.
//! A split never inserts a thread at an occupied address, and a `Jump`
//! into an occupied address kills the jumping thread.  Since threads are
//! only distinguishable by their address and their save slots, and the
//! earlier occupant has priority anyway, the arriving thread can never
//! contribute a better match.  This keeps the parked frontier bounded by
//! the number of instruction addresses in the program.
//!
//! ## The search prefix
//!
//! Every program starts with an implicit `.*?`:
//!
//! ```text
//!  0    split (prioritize child) 11    ; try the pattern here first,
//!  5    any char                       ; otherwise consume one codepoint
//!  6    split (prioritize parent) 5    ; and try again at the next one
//! 11    <pattern>
//! ```
//!
//! Search-mode execution seeds its initial thread at offset 0 and may
//! therefore start matching at any position; anchored execution seeds at
//! offset 11 (`PREFIX_SIZE`), skipping the loop, and only accepts a
//! `Match` reached at the end of the subject.

use std::fmt;
use std::io::Write;
use std::ops::Index;

use indexmap::IndexSet;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// An error produced while compiling a pattern.
///
/// Each variant carries the byte offset into the pattern at which the
/// problem was detected.  Execution itself never fails; only compilation
/// does.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The pattern contains a byte sequence that is not valid UTF-8.
    InvalidUtf8(usize),
    /// A `(` group is missing its closing `)`.
    UnclosedParen(usize),
    /// A `[` character class is missing its closing `]`.
    UnclosedClass(usize),
    /// A class range whose lower bound is above its upper bound.
    InvalidRange(usize),
    /// A `{` quantifier is missing its closing `}`.
    ExpectedClosingBrace(usize),
    /// `\` followed by something that is neither a control escape nor a
    /// syntax character.
    UnknownEscape(usize),
    /// An empty alternative or a stray operator.
    Parse(usize),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtf8(pos) => write!(f, "invalid utf-8 in pattern at byte {}", pos),
            Self::UnclosedParen(pos) => write!(f, "unclosed parenthesis at byte {}", pos),
            Self::UnclosedClass(pos) => write!(f, "unclosed character class at byte {}", pos),
            Self::InvalidRange(pos) => write!(f, "invalid range specified at byte {}", pos),
            Self::ExpectedClosingBrace(pos) => write!(f, "expected closing brace at byte {}", pos),
            Self::UnknownEscape(pos) => write!(f, "unknown atom escape at byte {}", pos),
            Self::Parse(pos) => write!(f, "parse error in alternative at byte {}", pos),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// UTF-8 decoding
// ---------------------------------------------------------------------------

/// Decode the UTF-8 sequence starting at `pos`, returning the codepoint
/// and its encoded length.  Returns `None` for truncated, overlong or
/// otherwise invalid sequences.
fn decode_utf8(bytes: &[u8], pos: usize) -> Option<(char, usize)> {
    let b0 = *bytes.get(pos)?;
    if b0 < 0x80 {
        return Some((b0 as char, 1));
    }
    let len = match b0 {
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => return None,
    };
    let mut cp = (b0 as u32) & (0x7F >> len);
    for i in 1..len {
        let b = *bytes.get(pos + i)?;
        if b & 0xC0 != 0x80 {
            return None;
        }
        cp = cp << 6 | (b & 0x3F) as u32;
    }
    let cp = char::from_u32(cp)?;
    // A valid codepoint re-encodes to the same length; a shorter one
    // means the input was overlong.
    if cp.len_utf8() != len {
        return None;
    }
    Some((cp, len))
}

/// Like [`decode_utf8`], but substitutes U+FFFD (advancing one byte) for
/// invalid sequences instead of failing.  Used on the subject and on
/// bytecode payloads, where well-formedness is the producer's
/// responsibility.
fn decode_utf8_lossy(bytes: &[u8], pos: usize) -> (char, usize) {
    decode_utf8(bytes, pos).unwrap_or((char::REPLACEMENT_CHARACTER, 1))
}

/// A forward-only codepoint cursor over a byte slice.
///
/// Exposes the byte-accurate position alongside each decoded codepoint.
/// The cursor is `Copy`, so lookahead is a plain copy that is assigned
/// back on commit.
#[derive(Clone, Copy, Debug)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn pos(&self) -> usize {
        self.pos
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the codepoint at the cursor without advancing.  `Ok(None)`
    /// at end of input.
    fn peek(&self) -> Result<Option<char>, Error> {
        if self.at_end() {
            return Ok(None);
        }
        match decode_utf8(self.bytes, self.pos) {
            Some((cp, _)) => Ok(Some(cp)),
            None => Err(Error::InvalidUtf8(self.pos)),
        }
    }

    /// Decode the codepoint at the cursor and advance past it.
    fn bump(&mut self) -> Result<Option<char>, Error> {
        if self.at_end() {
            return Ok(None);
        }
        match decode_utf8(self.bytes, self.pos) {
            Some((cp, len)) => {
                self.pos += len;
                Ok(Some(cp))
            }
            None => Err(Error::InvalidUtf8(self.pos)),
        }
    }
}

// ---------------------------------------------------------------------------
// Quantifier
// ---------------------------------------------------------------------------

/// How many times an atom may repeat.
///
/// For `RepeatMinMax`, `None` means the bound was not written: a missing
/// `min` is treated as zero, a missing `max` as unbounded.  `{n}` (no
/// comma) leaves `max` unset, so it behaves as `{n,}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Quantifier {
    One,
    Optional,
    RepeatZeroOrMore,
    RepeatOneOrMore,
    RepeatMinMax { min: Option<u32>, max: Option<u32> },
}

impl Quantifier {
    /// `true` when zero repetitions are allowed.
    fn allows_none(self) -> bool {
        match self {
            Self::One | Self::RepeatOneOrMore => false,
            Self::Optional | Self::RepeatZeroOrMore => true,
            Self::RepeatMinMax { min, .. } => min.unwrap_or(0) == 0,
        }
    }

    /// `true` when there is no upper bound on repetitions.
    fn allows_infinite_repeat(self) -> bool {
        match self {
            Self::One | Self::Optional => false,
            Self::RepeatZeroOrMore | Self::RepeatOneOrMore => true,
            Self::RepeatMinMax { max, .. } => max.is_none(),
        }
    }
}

// ---------------------------------------------------------------------------
// Character ranges
// ---------------------------------------------------------------------------

/// A codepoint range in a character class.  `max == None` is the
/// single-codepoint sentinel: the range matches exactly `min`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct CharRange {
    min: char,
    max: Option<char>,
}

impl CharRange {
    fn single(min: char) -> Self {
        Self { min, max: None }
    }

    fn is_single(self) -> bool {
        self.max.is_none()
    }
}

/// Index into the character-range table ([`ParsedRegex::ranges`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RangeSetIdx(usize);

impl RangeSetIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0
    }
}

/// `ranges[range_set_idx]` — typed access to the range table.
impl Index<RangeSetIdx> for [Box<[CharRange]>] {
    type Output = [CharRange];

    #[inline]
    fn index(&self, idx: RangeSetIdx) -> &[CharRange] {
        &self[idx.idx()]
    }
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A node of the pattern AST.  Ownership is strictly hierarchical: each
/// parent exclusively owns its children, so the tree is a plain
/// recursive sum with no sharing.
#[derive(Debug)]
struct AstNode {
    kind: AstKind,
    quantifier: Quantifier,
}

#[derive(Debug)]
enum AstKind {
    Literal(char),
    AnyChar,
    CharRange(RangeSetIdx),
    NegativeCharRange(RangeSetIdx),
    /// One alternative: its terms in order.  `capture` is the group this
    /// subtree belongs to, if any.
    Sequence {
        capture: Option<usize>,
        children: Vec<AstNode>,
    },
    /// Exactly two branches; `a|b|c` parses right-nested.
    Alternation {
        capture: Option<usize>,
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
    },
    LineStart,
    LineEnd,
    WordBoundary,
    NotWordBoundary,
    SubjectBegin,
    SubjectEnd,
}

impl AstNode {
    fn leaf(kind: AstKind) -> Self {
        Self {
            kind,
            quantifier: Quantifier::One,
        }
    }

    /// The capture group recorded on this node, if the node is a group
    /// body (`Sequence` or `Alternation`).
    fn capture(&self) -> Option<usize> {
        match self.kind {
            AstKind::Sequence { capture, .. } | AstKind::Alternation { capture, .. } => capture,
            _ => None,
        }
    }

    fn set_capture(&mut self, capture: Option<usize>) {
        match &mut self.kind {
            AstKind::Sequence { capture: slot, .. }
            | AstKind::Alternation { capture: slot, .. } => *slot = capture,
            _ => {}
        }
    }
}

/// The parser's output: the root AST node, the number of capture groups
/// (group 0, the overall match, included), and the table of
/// character-range sets referenced by class nodes.
#[derive(Debug)]
struct ParsedRegex {
    ast: AstNode,
    capture_count: usize,
    ranges: Box<[Box<[CharRange]>]>,
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// `true` for the characters that cannot appear as bare literals.
fn is_syntax_character(cp: char) -> bool {
    "^$\\.*+?()[]{}|".contains(cp)
}

/// Recursive descent parser.  The grammar, top-down:
///
/// ```text
/// disjunction := alternative ( '|' disjunction )?
/// alternative := term+
/// term        := assertion | atom quantifier?
/// assertion   := '^' | '$' | '\b' | '\B' | '\`' | '\''
/// atom        := '.' | '(' disjunction ')' | '\' escape
///              | '[' class ']' | literal
/// quantifier  := '*' | '+' | '?' | '{' int? (',' int?)? '}'
/// ```
///
/// Capture numbering is depth-first in source order: the root disjunction
/// is group 0 and each `(` takes the next number before its body is
/// parsed.  Identical class range lists are interned, so `[ab][ab]`
/// stores one table entry.
struct Parser<'a> {
    cursor: Cursor<'a>,
    capture_count: usize,
    ranges: IndexSet<Box<[CharRange]>>,
}

impl<'a> Parser<'a> {
    fn parse(pattern: &'a [u8]) -> Result<ParsedRegex, Error> {
        let mut parser = Parser {
            cursor: Cursor::new(pattern),
            capture_count: 1,
            ranges: IndexSet::new(),
        };
        let ast = parser.disjunction(Some(0))?;
        // Anything the grammar could not consume is a stray operator
        // (an unmatched `)`, a dangling quantifier, ...).
        if !parser.cursor.at_end() {
            return Err(Error::Parse(parser.cursor.pos()));
        }
        Ok(ParsedRegex {
            ast,
            capture_count: parser.capture_count,
            ranges: parser.ranges.into_iter().collect(),
        })
    }

    fn disjunction(&mut self, capture: Option<usize>) -> Result<AstNode, Error> {
        let mut node = self.alternative()?;
        if self.cursor.peek()? != Some('|') {
            node.set_capture(capture);
            return Ok(node);
        }
        self.cursor.bump()?;
        let rhs = self.disjunction(None)?;
        Ok(AstNode {
            kind: AstKind::Alternation {
                capture,
                lhs: Box::new(node),
                rhs: Box::new(rhs),
            },
            quantifier: Quantifier::One,
        })
    }

    fn alternative(&mut self) -> Result<AstNode, Error> {
        let mut children = Vec::new();
        while let Some(node) = self.term()? {
            children.push(node);
        }
        if children.is_empty() {
            return Err(Error::Parse(self.cursor.pos()));
        }
        Ok(AstNode {
            kind: AstKind::Sequence {
                capture: None,
                children,
            },
            quantifier: Quantifier::One,
        })
    }

    fn term(&mut self) -> Result<Option<AstNode>, Error> {
        if let Some(node) = self.assertion()? {
            return Ok(Some(node));
        }
        match self.atom()? {
            Some(mut node) => {
                node.quantifier = self.quantifier()?;
                Ok(Some(node))
            }
            None => Ok(None),
        }
    }

    fn assertion(&mut self) -> Result<Option<AstNode>, Error> {
        match self.cursor.peek()? {
            Some('^') => {
                self.cursor.bump()?;
                Ok(Some(AstNode::leaf(AstKind::LineStart)))
            }
            Some('$') => {
                self.cursor.bump()?;
                Ok(Some(AstNode::leaf(AstKind::LineEnd)))
            }
            Some('\\') => {
                let mut look = self.cursor;
                look.bump()?;
                let kind = match look.peek()? {
                    Some('b') => AstKind::WordBoundary,
                    Some('B') => AstKind::NotWordBoundary,
                    Some('`') => AstKind::SubjectBegin,
                    Some('\'') => AstKind::SubjectEnd,
                    _ => return Ok(None),
                };
                look.bump()?;
                self.cursor = look;
                Ok(Some(AstNode::leaf(kind)))
            }
            _ => Ok(None),
        }
    }

    fn atom(&mut self) -> Result<Option<AstNode>, Error> {
        let cp = match self.cursor.peek()? {
            Some(cp) => cp,
            None => return Ok(None),
        };
        match cp {
            '.' => {
                self.cursor.bump()?;
                Ok(Some(AstNode::leaf(AstKind::AnyChar)))
            }
            '(' => {
                self.cursor.bump()?;
                let capture = self.capture_count;
                self.capture_count += 1;
                let content = self.disjunction(Some(capture))?;
                if self.cursor.peek()? != Some(')') {
                    return Err(Error::UnclosedParen(self.cursor.pos()));
                }
                self.cursor.bump()?;
                Ok(Some(content))
            }
            '\\' => {
                self.cursor.bump()?;
                self.atom_escape().map(Some)
            }
            '[' => {
                self.cursor.bump()?;
                self.character_class().map(Some)
            }
            _ if is_syntax_character(cp) => Ok(None),
            _ => {
                self.cursor.bump()?;
                Ok(Some(AstNode::leaf(AstKind::Literal(cp))))
            }
        }
    }

    fn atom_escape(&mut self) -> Result<AstNode, Error> {
        let pos = self.cursor.pos();
        let cp = match self.cursor.peek()? {
            Some(cp) => cp,
            None => return Err(Error::UnknownEscape(pos)),
        };
        let control = match cp {
            'f' => Some('\x0C'),
            'n' => Some('\n'),
            'r' => Some('\r'),
            't' => Some('\t'),
            'v' => Some('\x0B'),
            _ => None,
        };
        if let Some(value) = control {
            self.cursor.bump()?;
            return Ok(AstNode::leaf(AstKind::Literal(value)));
        }
        if is_syntax_character(cp) {
            self.cursor.bump()?;
            return Ok(AstNode::leaf(AstKind::Literal(cp)));
        }
        Err(Error::UnknownEscape(pos))
    }

    fn character_class(&mut self) -> Result<AstNode, Error> {
        let negative = self.cursor.peek()? == Some('^');
        if negative {
            self.cursor.bump()?;
        }

        let mut ranges = Vec::new();
        loop {
            let cp = match self.cursor.peek()? {
                None | Some(']') => break,
                Some(cp) => cp,
            };
            self.cursor.bump()?;
            // A `-` with no pending left-hand side is the literal sentinel.
            if cp == '-' {
                ranges.push(CharRange::single('-'));
                continue;
            }
            if self.cursor.at_end() {
                break;
            }
            let mut range = CharRange::single(cp);
            if self.cursor.peek()? == Some('-') {
                self.cursor.bump()?;
                // `-` with a left-hand side takes whatever follows as the
                // upper bound, a closing `]` included.
                let max = match self.cursor.bump()? {
                    Some(max) => max,
                    None => break,
                };
                if cp > max {
                    return Err(Error::InvalidRange(self.cursor.pos()));
                }
                range.max = Some(max);
            }
            ranges.push(range);
        }
        if self.cursor.at_end() {
            return Err(Error::UnclosedClass(self.cursor.pos()));
        }
        self.cursor.bump()?;

        let (id, _) = self.ranges.insert_full(ranges.into_boxed_slice());
        let idx = RangeSetIdx(id);
        Ok(AstNode::leaf(if negative {
            AstKind::NegativeCharRange(idx)
        } else {
            AstKind::CharRange(idx)
        }))
    }

    fn quantifier(&mut self) -> Result<Quantifier, Error> {
        match self.cursor.peek()? {
            Some('*') => {
                self.cursor.bump()?;
                Ok(Quantifier::RepeatZeroOrMore)
            }
            Some('+') => {
                self.cursor.bump()?;
                Ok(Quantifier::RepeatOneOrMore)
            }
            Some('?') => {
                self.cursor.bump()?;
                Ok(Quantifier::Optional)
            }
            Some('{') => {
                let mut look = self.cursor;
                look.bump()?;
                let min = Self::read_int(&mut look)?;
                let mut max = None;
                if look.peek()? == Some(',') {
                    look.bump()?;
                    max = Self::read_int(&mut look)?;
                }
                if look.peek()? != Some('}') {
                    return Err(Error::ExpectedClosingBrace(look.pos()));
                }
                look.bump()?;
                self.cursor = look;
                Ok(Quantifier::RepeatMinMax { min, max })
            }
            _ => Ok(Quantifier::One),
        }
    }

    /// Read a decimal integer; `None` when no digit is present.
    fn read_int(cursor: &mut Cursor) -> Result<Option<u32>, Error> {
        let mut value: Option<u32> = None;
        while let Some(cp) = cursor.peek()? {
            let digit = match cp.to_digit(10) {
                Some(digit) => digit,
                None => break,
            };
            value = Some(value.unwrap_or(0).saturating_mul(10).saturating_add(digit));
            cursor.bump()?;
        }
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Bytecode model
// ---------------------------------------------------------------------------

/// A byte offset into the program, used as a jump target.
type Offset = u32;

const OFFSET_SIZE: usize = std::mem::size_of::<Offset>();

/// Byte length of the implicit `.*?` search prefix.
const PREFIX_SIZE: usize = 3 + 2 * OFFSET_SIZE;

/// One instruction opcode.  Payloads follow the opcode byte directly:
///
/// | opcode                                  | payload                       |
/// |-----------------------------------------|-------------------------------|
/// | `Literal`                               | UTF-8 codepoint               |
/// | `Jump`, `SplitPrioritize{Parent,Child}` | `Offset` (little endian)      |
/// | `Save`                                  | 1 byte slot index             |
/// | `CharRange`, `NegativeCharRange`        | 1 byte single count, 1 byte   |
/// |                                         | range count, then the singles |
/// |                                         | and the range pairs in UTF-8  |
/// | everything else                         | —                             |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Match,
    Literal,
    AnyChar,
    CharRange,
    NegativeCharRange,
    Jump,
    SplitPrioritizeParent,
    SplitPrioritizeChild,
    Save,
    LineStart,
    LineEnd,
    WordBoundary,
    NotWordBoundary,
    SubjectBegin,
    SubjectEnd,
}

impl Op {
    fn from_byte(byte: u8) -> Op {
        const OPS: [Op; 15] = [
            Op::Match,
            Op::Literal,
            Op::AnyChar,
            Op::CharRange,
            Op::NegativeCharRange,
            Op::Jump,
            Op::SplitPrioritizeParent,
            Op::SplitPrioritizeChild,
            Op::Save,
            Op::LineStart,
            Op::LineEnd,
            Op::WordBoundary,
            Op::NotWordBoundary,
            Op::SubjectBegin,
            Op::SubjectEnd,
        ];
        OPS[byte as usize]
    }
}

fn read_offset(code: &[u8], pos: usize) -> Offset {
    Offset::from_le_bytes([code[pos], code[pos + 1], code[pos + 2], code[pos + 3]])
}

/// A compiled program, immutable once built.  Holds no execution state,
/// so one program may back any number of [`ThreadedRegexVm`]s.
#[derive(Debug)]
pub struct CompiledRegex {
    bytecode: Vec<u8>,
    save_count: usize,
}

impl CompiledRegex {
    /// Number of save slots a thread carries: two per capture group
    /// (start and end), group 0 included.
    pub fn save_count(&self) -> usize {
        self.save_count
    }

    /// Total memory footprint (in bytes) of this compiled program,
    /// including both inline and heap-allocated data.
    pub fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.bytecode.len()
    }

    /// Disassemble the program, one line per instruction prefixed with
    /// its byte offset.
    pub fn dump(&self, mut buffer: impl Write) {
        let code = &self.bytecode;
        let mut pos = 0;
        while pos < code.len() {
            write!(buffer, "{:4}    ", pos).unwrap();
            let op = Op::from_byte(code[pos]);
            pos += 1;
            match op {
                Op::Match => writeln!(buffer, "match").unwrap(),
                Op::Literal => {
                    let (cp, len) = decode_utf8_lossy(code, pos);
                    pos += len;
                    writeln!(buffer, "literal {}", cp).unwrap();
                }
                Op::AnyChar => writeln!(buffer, "any char").unwrap(),
                Op::Jump => {
                    writeln!(buffer, "jump {}", read_offset(code, pos)).unwrap();
                    pos += OFFSET_SIZE;
                }
                Op::SplitPrioritizeParent | Op::SplitPrioritizeChild => {
                    let which = if op == Op::SplitPrioritizeParent {
                        "parent"
                    } else {
                        "child"
                    };
                    writeln!(
                        buffer,
                        "split (prioritize {}) {}",
                        which,
                        read_offset(code, pos)
                    )
                    .unwrap();
                    pos += OFFSET_SIZE;
                }
                Op::Save => {
                    writeln!(buffer, "save {}", code[pos]).unwrap();
                    pos += 1;
                }
                Op::CharRange | Op::NegativeCharRange => {
                    let negative = if op == Op::NegativeCharRange {
                        "negative "
                    } else {
                        ""
                    };
                    write!(buffer, "{}char range, [", negative).unwrap();
                    let single_count = code[pos] as usize;
                    let range_count = code[pos + 1] as usize;
                    pos += 2;
                    for _ in 0..single_count {
                        let (cp, len) = decode_utf8_lossy(code, pos);
                        pos += len;
                        write!(buffer, "{}", cp).unwrap();
                    }
                    write!(buffer, "]").unwrap();
                    for _ in 0..range_count {
                        let (min, len) = decode_utf8_lossy(code, pos);
                        pos += len;
                        let (max, len) = decode_utf8_lossy(code, pos);
                        pos += len;
                        write!(buffer, " [{}-{}]", min, max).unwrap();
                    }
                    writeln!(buffer).unwrap();
                }
                Op::LineStart => writeln!(buffer, "line start").unwrap(),
                Op::LineEnd => writeln!(buffer, "line end").unwrap(),
                Op::WordBoundary => writeln!(buffer, "word boundary").unwrap(),
                Op::NotWordBoundary => writeln!(buffer, "not word boundary").unwrap(),
                Op::SubjectBegin => writeln!(buffer, "subject begin").unwrap(),
                Op::SubjectEnd => writeln!(buffer, "subject end").unwrap(),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Lowers a [`ParsedRegex`] to bytecode.
///
/// The program is written front to back into a growable byte buffer.
/// Forward jump targets are backpatched:
/// [`alloc_offset`](Self::alloc_offset) reserves a zeroed `Offset`-sized
/// slot and returns its position, [`patch_offset`](Self::patch_offset)
/// fills it once the target address is known.
struct Compiler<'a> {
    parsed: &'a ParsedRegex,
    bytecode: Vec<u8>,
}

impl<'a> Compiler<'a> {
    fn compile(parsed: &'a ParsedRegex) -> CompiledRegex {
        let mut compiler = Compiler {
            parsed,
            bytecode: Vec::new(),
        };
        compiler.write_search_prefix();
        compiler.compile_node(&parsed.ast);
        compiler.bytecode.push(Op::Match as u8);
        CompiledRegex {
            bytecode: compiler.bytecode,
            save_count: parsed.capture_count * 2,
        }
    }

    /// Reserve an `Offset`-sized slot and return its position for a later
    /// [`patch_offset`](Self::patch_offset).
    fn alloc_offset(&mut self) -> usize {
        let pos = self.bytecode.len();
        self.bytecode.extend_from_slice(&[0; OFFSET_SIZE]);
        pos
    }

    fn patch_offset(&mut self, slot: usize, target: usize) {
        self.bytecode[slot..slot + OFFSET_SIZE]
            .copy_from_slice(&(target as Offset).to_le_bytes());
    }

    fn push_codepoint(&mut self, cp: char) {
        let mut buf = [0u8; 4];
        self.bytecode
            .extend_from_slice(cp.encode_utf8(&mut buf).as_bytes());
    }

    /// Emit the implicit `.*?` prefix executed in search mode.
    fn write_search_prefix(&mut self) {
        debug_assert!(self.bytecode.is_empty());
        self.bytecode.push(Op::SplitPrioritizeChild as u8);
        let skip = self.alloc_offset();
        self.patch_offset(skip, PREFIX_SIZE);
        self.bytecode.push(Op::AnyChar as u8);
        self.bytecode.push(Op::SplitPrioritizeParent as u8);
        let back = self.alloc_offset();
        self.patch_offset(back, 1 + OFFSET_SIZE);
    }

    /// Emit one atom, bracketed by its `Save` pair when the node carries
    /// a capture group.  Returns the block's start offset.
    fn compile_node_inner(&mut self, node: &AstNode) -> usize {
        let start_pos = self.bytecode.len();

        let capture = node.capture();
        if let Some(capture) = capture {
            self.bytecode.push(Op::Save as u8);
            self.bytecode.push((capture * 2) as u8);
        }

        let mut goto_inner_end_offsets = Vec::new();
        match &node.kind {
            AstKind::Literal(cp) => {
                self.bytecode.push(Op::Literal as u8);
                self.push_codepoint(*cp);
            }
            AstKind::AnyChar => self.bytecode.push(Op::AnyChar as u8),
            AstKind::CharRange(id) | AstKind::NegativeCharRange(id) => {
                let parsed = self.parsed;
                let ranges = &parsed.ranges[*id];
                let single_count = ranges.iter().filter(|r| r.is_single()).count();
                self.bytecode
                    .push(if matches!(node.kind, AstKind::CharRange(_)) {
                        Op::CharRange as u8
                    } else {
                        Op::NegativeCharRange as u8
                    });
                self.bytecode.push(single_count as u8);
                self.bytecode.push((ranges.len() - single_count) as u8);
                // Singles first so the matcher can test them before the
                // proper ranges.
                for range in ranges.iter().filter(|r| r.is_single()) {
                    self.push_codepoint(range.min);
                }
                for range in ranges {
                    if let Some(max) = range.max {
                        self.push_codepoint(range.min);
                        self.push_codepoint(max);
                    }
                }
            }
            AstKind::Sequence { children, .. } => {
                for child in children {
                    self.compile_node(child);
                }
            }
            AstKind::Alternation { lhs, rhs, .. } => {
                self.bytecode.push(Op::SplitPrioritizeParent as u8);
                let offset = self.alloc_offset();

                self.compile_node(lhs);
                self.bytecode.push(Op::Jump as u8);
                goto_inner_end_offsets.push(self.alloc_offset());

                let right_pos = self.compile_node(rhs);
                self.patch_offset(offset, right_pos);
            }
            AstKind::LineStart => self.bytecode.push(Op::LineStart as u8),
            AstKind::LineEnd => self.bytecode.push(Op::LineEnd as u8),
            AstKind::WordBoundary => self.bytecode.push(Op::WordBoundary as u8),
            AstKind::NotWordBoundary => self.bytecode.push(Op::NotWordBoundary as u8),
            AstKind::SubjectBegin => self.bytecode.push(Op::SubjectBegin as u8),
            AstKind::SubjectEnd => self.bytecode.push(Op::SubjectEnd as u8),
        }

        let end = self.bytecode.len();
        for slot in goto_inner_end_offsets {
            self.patch_offset(slot, end);
        }

        if let Some(capture) = capture {
            self.bytecode.push(Op::Save as u8);
            self.bytecode.push((capture * 2 + 1) as u8);
        }

        start_pos
    }

    /// Emit one node with its quantifier machinery.  Returns the block's
    /// start offset.
    ///
    /// Mandatory repetitions are unrolled; an unbounded tail becomes a
    /// `SplitPrioritizeChild` looping back to the last unrolled copy; a
    /// bounded tail becomes one skippable copy per remaining repetition.
    /// All skip offsets are backpatched to past-the-end.
    fn compile_node(&mut self, node: &AstNode) -> usize {
        let pos = self.bytecode.len();
        let mut goto_end_offsets = Vec::new();

        if node.quantifier.allows_none() {
            self.bytecode.push(Op::SplitPrioritizeParent as u8);
            goto_end_offsets.push(self.alloc_offset());
        }

        let mut inner_pos = self.compile_node_inner(node);
        let min = match node.quantifier {
            Quantifier::RepeatMinMax { min, .. } => min.unwrap_or(0),
            _ => 0,
        };
        for _ in 1..min {
            inner_pos = self.compile_node_inner(node);
        }

        if node.quantifier.allows_infinite_repeat() {
            self.bytecode.push(Op::SplitPrioritizeChild as u8);
            let slot = self.alloc_offset();
            self.patch_offset(slot, inner_pos);
        } else if let Quantifier::RepeatMinMax { max: Some(max), .. } = node.quantifier {
            for _ in min.max(1)..max {
                self.bytecode.push(Op::SplitPrioritizeParent as u8);
                goto_end_offsets.push(self.alloc_offset());
                self.compile_node_inner(node);
            }
        }

        let end = self.bytecode.len();
        for slot in goto_end_offsets {
            self.patch_offset(slot, end);
        }

        pos
    }
}

/// Parse and compile a pattern.
///
/// The pattern is a byte slice decoded as UTF-8; malformed UTF-8 is
/// reported as [`Error::InvalidUtf8`].  No partial programs are returned:
/// the first structural error aborts compilation.
pub fn compile(pattern: &[u8]) -> Result<CompiledRegex, Error> {
    let parsed = Parser::parse(pattern)?;
    Ok(Compiler::compile(&parsed))
}

// ---------------------------------------------------------------------------
// Thread VM
// ---------------------------------------------------------------------------

/// Sentinel instruction pointer marking a dead thread.  Never a valid
/// program offset, so duplicate-collapse scans skip dead threads for
/// free.
const DEAD: usize = usize::MAX;

/// A virtual execution cursor: an instruction pointer and one save slot
/// per capture boundary (`None` = unset).
#[derive(Debug)]
struct Thread {
    ip: usize,
    saves: Vec<Option<usize>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepResult {
    Consumed,
    Matched,
    Failed,
}

/// Per-position input state handed to [`ThreadedRegexVm::step`].
#[derive(Clone, Copy, Debug)]
struct StepContext {
    /// Codepoint at the cursor; `None` at end of input.
    cp: Option<char>,
    /// Byte offset of the cursor.
    pos: usize,
    /// Codepoint immediately before the cursor; `None` at the start.
    prev: Option<char>,
    at_end: bool,
}

/// Underscore or alphanumeric; positions outside the subject count as
/// non-word.
fn is_word(cp: Option<char>) -> bool {
    cp.map_or(false, |cp| cp == '_' || cp.is_alphanumeric())
}

/// Executes a [`CompiledRegex`] against subjects.
///
/// The VM owns all of its execution state, so several VMs may share one
/// program.  Save-slot vectors are recycled through an internal free
/// list, across threads and across [`exec`](Self::exec) calls.
#[derive(Debug)]
pub struct ThreadedRegexVm<'a> {
    program: &'a CompiledRegex,
    /// Live threads in match-priority order: earlier index wins.
    threads: Vec<Thread>,
    /// Free list of save-slot vectors.
    saves_pool: Vec<Vec<Option<usize>>>,
    /// Save slots of the best match found by the last `exec`.
    captures: Vec<Option<usize>>,
}

impl<'a> ThreadedRegexVm<'a> {
    pub fn new(program: &'a CompiledRegex) -> Self {
        Self {
            program,
            threads: Vec::new(),
            saves_pool: Vec::new(),
            captures: Vec::new(),
        }
    }

    /// Run the program against `subject`.
    ///
    /// With `anchored`, the subject must be consumed entirely; otherwise
    /// any matching substring is accepted.  With `longest`, scanning
    /// continues past the first match and the captures of the last
    /// (longest) one are kept; otherwise the first thread to reach
    /// `Match` wins.
    ///
    /// The subject is decoded as UTF-8 on the fly; well-formedness is
    /// the caller's responsibility (invalid sequences decode as U+FFFD).
    pub fn exec(&mut self, subject: &[u8], anchored: bool, longest: bool) -> bool {
        self.release_all_threads();
        self.captures.clear();
        self.captures.resize(self.program.save_count, None);

        let saves = self.alloc_saves();
        let start = if anchored { PREFIX_SIZE } else { 0 };
        self.threads.push(Thread { ip: start, saves });

        let mut found_match = false;
        let mut prev = None;
        let mut pos = 0;
        while pos < subject.len() {
            let (cp, len) = decode_utf8_lossy(subject, pos);
            let ctx = StepContext {
                cp: Some(cp),
                pos,
                prev,
                at_end: false,
            };
            let mut i = 0;
            while i < self.threads.len() {
                match self.step(i, &ctx) {
                    StepResult::Matched => {
                        // An anchored match must end at the end of the
                        // subject; the thread is already dead, drop it.
                        if !anchored {
                            self.captures.copy_from_slice(&self.threads[i].saves);
                            found_match = true;
                            self.truncate_threads(i);
                            if !longest {
                                return true;
                            }
                        }
                    }
                    StepResult::Failed => self.threads[i].ip = DEAD,
                    StepResult::Consumed => {}
                }
                i += 1;
            }
            self.compact_threads();
            if self.threads.is_empty() {
                return false;
            }
            prev = Some(cp);
            pos += len;
        }

        // One final step per surviving thread so end-of-input assertions
        // can fire and pending `Match` instructions are reached.
        let ctx = StepContext {
            cp: None,
            pos,
            prev,
            at_end: true,
        };
        let mut i = 0;
        while i < self.threads.len() {
            if self.step(i, &ctx) == StepResult::Matched {
                self.captures.copy_from_slice(&self.threads[i].saves);
                found_match = true;
                self.truncate_threads(i);
                if !longest {
                    return true;
                }
            }
            i += 1;
        }
        found_match
    }

    /// Save slots of the last successful `exec`, two per capture group:
    /// slots `2k` and `2k + 1` bound group `k` as byte offsets into the
    /// subject.
    pub fn captures(&self) -> &[Option<usize>] {
        &self.captures
    }

    /// Byte span of capture group `group` in the last matched subject,
    /// or `None` when the group did not participate in the match.
    pub fn capture(&self, group: usize) -> Option<(usize, usize)> {
        match (
            self.captures.get(group * 2),
            self.captures.get(group * 2 + 1),
        ) {
            (Some(&Some(start)), Some(&Some(end))) => Some((start, end)),
            _ => None,
        }
    }

    /// Run thread `index` until it consumes the current codepoint,
    /// matches, or fails.  Non-consuming instructions (jumps, splits,
    /// saves, assertions) are executed inline.
    fn step(&mut self, index: usize, ctx: &StepContext) -> StepResult {
        let program = self.program;
        let code = &program.bytecode;
        loop {
            let mut ip = self.threads[index].ip;
            let op = Op::from_byte(code[ip]);
            ip += 1;
            self.threads[index].ip = ip;
            match op {
                Op::Literal => {
                    let (cp, len) = decode_utf8_lossy(code, ip);
                    if ctx.cp == Some(cp) {
                        self.threads[index].ip = ip + len;
                        return StepResult::Consumed;
                    }
                    return StepResult::Failed;
                }
                Op::AnyChar => return StepResult::Consumed,
                Op::CharRange | Op::NegativeCharRange => {
                    let positive = op == Op::CharRange;
                    let single_count = code[ip] as usize;
                    let range_count = code[ip + 1] as usize;
                    ip += 2;
                    let mut hit = false;
                    for _ in 0..single_count {
                        let (candidate, len) = decode_utf8_lossy(code, ip);
                        ip += len;
                        if ctx.cp == Some(candidate) {
                            hit = true;
                        }
                    }
                    for _ in 0..range_count {
                        let (min, len) = decode_utf8_lossy(code, ip);
                        ip += len;
                        let (max, len) = decode_utf8_lossy(code, ip);
                        ip += len;
                        if let Some(cp) = ctx.cp {
                            if min <= cp && cp <= max {
                                hit = true;
                            }
                        }
                    }
                    self.threads[index].ip = ip;
                    return if hit == positive {
                        StepResult::Consumed
                    } else {
                        StepResult::Failed
                    };
                }
                Op::Jump => {
                    let target = read_offset(code, ip) as usize;
                    // Duplicate collapse: if the target is already
                    // occupied by a live thread, this thread can never
                    // contribute a better match.
                    if self.threads.iter().any(|t| t.ip == target) {
                        return StepResult::Failed;
                    }
                    self.threads[index].ip = target;
                }
                Op::SplitPrioritizeParent => {
                    let target = read_offset(code, ip) as usize;
                    self.fork(index, target);
                    self.threads[index].ip = ip + OFFSET_SIZE;
                }
                Op::SplitPrioritizeChild => {
                    let target = read_offset(code, ip) as usize;
                    self.fork(index, ip + OFFSET_SIZE);
                    self.threads[index].ip = target;
                }
                Op::Save => {
                    let slot = code[ip] as usize;
                    self.threads[index].saves[slot] = Some(ctx.pos);
                    self.threads[index].ip = ip + 1;
                }
                Op::LineStart => {
                    if !(ctx.pos == 0 || ctx.prev == Some('\n')) {
                        return StepResult::Failed;
                    }
                }
                Op::LineEnd => {
                    if !(ctx.at_end || ctx.cp == Some('\n')) {
                        return StepResult::Failed;
                    }
                }
                Op::WordBoundary => {
                    if is_word(ctx.prev) == is_word(ctx.cp) {
                        return StepResult::Failed;
                    }
                }
                Op::NotWordBoundary => {
                    if is_word(ctx.prev) != is_word(ctx.cp) {
                        return StepResult::Failed;
                    }
                }
                Op::SubjectBegin => {
                    if ctx.pos != 0 {
                        return StepResult::Failed;
                    }
                }
                Op::SubjectEnd => {
                    if !ctx.at_end {
                        return StepResult::Failed;
                    }
                }
                Op::Match => {
                    self.threads[index].ip = DEAD;
                    return StepResult::Matched;
                }
            }
        }
    }

    /// Insert a new thread at `from + 1` (just below thread `from` in
    /// priority) with a copy of its save slots.  Skipped entirely when a
    /// live thread already sits at `ip` (duplicate collapse).
    fn fork(&mut self, from: usize, ip: usize) {
        if self.threads.iter().any(|t| t.ip == ip) {
            return;
        }
        let mut saves = self.alloc_saves();
        saves.copy_from_slice(&self.threads[from].saves);
        self.threads.insert(from + 1, Thread { ip, saves });
    }

    /// Remove dead threads, preserving the order of the survivors.
    fn compact_threads(&mut self) {
        let Self {
            threads,
            saves_pool,
            ..
        } = self;
        threads.retain_mut(|thread| {
            if thread.ip == DEAD {
                saves_pool.push(std::mem::take(&mut thread.saves));
                false
            } else {
                true
            }
        });
    }

    /// Drop thread `len` and everything below it in priority.
    fn truncate_threads(&mut self, len: usize) {
        for thread in self.threads.split_off(len) {
            self.saves_pool.push(thread.saves);
        }
    }

    fn release_all_threads(&mut self) {
        let Self {
            threads,
            saves_pool,
            ..
        } = self;
        for thread in threads.drain(..) {
            saves_pool.push(thread.saves);
        }
    }

    fn alloc_saves(&mut self) -> Vec<Option<usize>> {
        match self.saves_pool.pop() {
            Some(mut saves) => {
                saves.clear();
                saves.resize(self.program.save_count, None);
                saves
            }
            None => vec![None; self.program.save_count],
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
