//! Org outline library: a line tokenizer, a recursive-descent parser that builds an
//! arena-backed section tree, structural edits over that tree, and a renderer that turns
//! the tree back into Org text.
//!
//! ```text
//! text -> lexer::Tokenizer (patterns::PatternCache) -> parser::OrgParser -> core::Document
//!      -> format::format_document | export::document_to_json | Document::move_*
//! ```

pub mod core {
    use crate::patterns::PatternCache;
    use chrono::{NaiveDate, NaiveTime};
    use indexmap::IndexMap;
    use serde::Serialize;
    use std::{fmt, str::FromStr};

    /* ------------------------------- IDs ------------------------------- */

    /// Stable handle of a section inside a document's arena.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct SectionId(pub usize);

    /// Root-to-node path of sibling offsets: `[0]` is the first top-level node, `[0, 2]`
    /// the third child of the first top-level node.
    ///
    /// Never empty. The parser derives every index from [`OrgIndex::root`] using only
    /// [`OrgIndex::next`] and [`OrgIndex::descend`].
    #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct OrgIndex(Vec<usize>);

    impl OrgIndex {
        pub fn root() -> Self {
            Self(vec![0])
        }

        /// Builds an index from an explicit path; `None` for an empty path.
        pub fn from_path(path: &[usize]) -> Option<Self> {
            if path.is_empty() {
                None
            } else {
                Some(Self(path.to_vec()))
            }
        }

        /// Next sibling: last component plus one.
        pub fn next(&self) -> Self {
            let mut path = self.0.clone();
            if let Some(last) = path.last_mut() {
                *last += 1;
            }
            Self(path)
        }

        /// First child of the node at this index.
        pub fn descend(&self) -> Self {
            let mut path = self.0.clone();
            path.push(0);
            Self(path)
        }

        pub fn path(&self) -> &[usize] {
            &self.0
        }

        pub fn depth(&self) -> usize {
            self.0.len()
        }
    }

    impl fmt::Display for OrgIndex {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
            f.write_str(&parts.join("."))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum IndexParseError {
        #[error("index path is empty")]
        Empty,
        #[error("invalid index component {0:?}")]
        Component(String),
    }

    /// Parses dotted paths such as `0.2.1`.
    impl FromStr for OrgIndex {
        type Err = IndexParseError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Err(IndexParseError::Empty);
            }
            let path = trimmed
                .split('.')
                .map(|part| {
                    part.trim()
                        .parse::<usize>()
                        .map_err(|_| IndexParseError::Component(part.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Self(path))
        }
    }

    /* ------------------------------ Aggregate ------------------------------ */

    /// Aggregate root: one parsed outline.
    ///
    /// Sections live in an arena owned by the document; the tree shape is expressed by
    /// [`Node::Section`] handles in `content` lists. Every attached section is referenced
    /// from exactly one content list.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Document {
        /// `#+KEY: value` lines, keys kept verbatim.
        pub settings: IndexMap<String, String>,

        /// Top-level nodes in source order.
        pub content: Vec<Node>,

        sections: Vec<Section>,

        default_todos: Vec<Vec<String>>,
    }

    impl Document {
        pub fn new(default_todos: Vec<Vec<String>>) -> Self {
            Self {
                settings: IndexMap::new(),
                content: vec![],
                sections: vec![],
                default_todos,
            }
        }

        /// Case-insensitive settings lookup.
        pub fn setting(&self, key: &str) -> Option<&str> {
            self.settings
                .iter()
                .rev()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| v.as_str())
        }

        pub fn title(&self) -> Option<&str> {
            self.setting("TITLE")
        }

        pub fn default_todos(&self) -> &[Vec<String>] {
            &self.default_todos
        }

        /// Effective TODO keyword groups: the `TODO` setting if present, else the defaults.
        pub fn todos(&self) -> Vec<Vec<String>> {
            match self.setting("TODO") {
                Some(line) => parse_todo_groups(line),
                None => self.default_todos.clone(),
            }
        }

        /// Every keyword of every group, in order.
        pub fn todo_keywords(&self) -> Vec<String> {
            self.todos().into_iter().flatten().collect()
        }

        /// Keywords in any group after the first are "done" states. With a single group the
        /// last keyword is the done state.
        pub fn is_done_keyword(&self, keyword: &str) -> bool {
            let groups = self.todos();
            match groups.as_slice() {
                [] => false,
                [only] => only.last().is_some_and(|k| k == keyword),
                [_, done @ ..] => done.iter().flatten().any(|k| k == keyword),
            }
        }

        pub fn section(&self, id: SectionId) -> Option<&Section> {
            self.sections.get(id.0)
        }

        pub fn section_mut(&mut self, id: SectionId) -> Option<&mut Section> {
            self.sections.get_mut(id.0)
        }

        /// Places a section in the arena. The section is not attached to the tree until a
        /// [`Node::Section`] handle is pushed into some content list.
        pub fn add_section(&mut self, section: Section) -> SectionId {
            self.sections.push(section);
            SectionId(self.sections.len() - 1)
        }

        /// All arena entries, attached or not.
        pub fn sections(&self) -> impl Iterator<Item = (SectionId, &Section)> {
            self.sections
                .iter()
                .enumerate()
                .map(|(i, s)| (SectionId(i), s))
        }

        pub(crate) fn arena(&self, id: SectionId) -> &Section {
            &self.sections[id.0]
        }

        pub(crate) fn arena_mut(&mut self, id: SectionId) -> &mut Section {
            &mut self.sections[id.0]
        }

        /// Canonical Org text for this document.
        pub fn to_text(&self) -> String {
            crate::format::format_document(self)
        }
    }

    /// Splits a `#+TODO:` value into groups; a literal `|` starts the next group.
    /// Fast-access suffixes such as `TODO(t)` are dropped.
    pub fn parse_todo_groups(line: &str) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = vec![vec![]];
        for word in line.split_whitespace() {
            if word == "|" {
                groups.push(vec![]);
                continue;
            }
            let keyword = match word.find('(') {
                Some(pos) if pos > 0 && word.ends_with(')') => &word[..pos],
                _ => word,
            };
            if let Some(group) = groups.last_mut() {
                group.push(keyword.to_string());
            }
        }
        groups
    }

    /* ------------------------------ Node model ------------------------------ */

    /// Every element that can appear in a content list.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Node {
        Section(SectionId),
        Paragraph(Paragraph),
        List(List),
        Table(Table),
        Drawer(Drawer),
        Planning(Planning),
        Footnote(Footnote),
        Block(Block),
        Comment(String),
        HorizontalRule,
    }

    impl Node {
        pub fn section_id(&self) -> Option<SectionId> {
            match self {
                Node::Section(id) => Some(*id),
                _ => None,
            }
        }

        pub fn kind_name(&self) -> &'static str {
            match self {
                Node::Section(_) => "section",
                Node::Paragraph(_) => "paragraph",
                Node::List(_) => "list",
                Node::Table(_) => "table",
                Node::Drawer(_) => "drawer",
                Node::Planning(_) => "planning",
                Node::Footnote(_) => "footnote",
                Node::Block(_) => "block",
                Node::Comment(_) => "comment",
                Node::HorizontalRule => "horizontal_rule",
            }
        }
    }

    /// A headline and everything under it until the next headline of equal or lower level.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Section {
        /// Position recorded at parse time (or by [`Document::reindex`]).
        pub index: Option<OrgIndex>,
        pub title: Option<String>,
        /// Number of leading stars, >= 1.
        pub level: usize,
        pub keyword: Option<String>,
        pub priority: Option<Priority>,
        pub tags: Vec<String>,
        pub content: Vec<Node>,
    }

    /// Single-letter priority such as `[#A]`, always uppercase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
    #[serde(transparent)]
    pub struct Priority(pub char);

    impl Priority {
        /// Accepts `A`, `B` or `C` in either case.
        pub fn parse(s: &str) -> Option<Self> {
            let mut chars = s.chars();
            let c = chars.next()?.to_ascii_uppercase();
            if chars.next().is_some() || !matches!(c, 'A' | 'B' | 'C') {
                return None;
            }
            Some(Self(c))
        }
    }

    impl Section {
        /// Builds a section from the raw headline text (everything after the stars),
        /// splitting it once into keyword, priority, title and tags. `todos` is the flat
        /// list of keywords active at this point of the document.
        pub fn new(
            level: usize,
            raw_title: Option<&str>,
            todos: &[String],
            patterns: &PatternCache,
        ) -> Self {
            let mut section = Self {
                index: None,
                title: None,
                level,
                keyword: None,
                priority: None,
                tags: vec![],
                content: vec![],
            };
            let Some(text) = raw_title else {
                return section;
            };

            let re = patterns.compile(&headline_title_pattern(todos));
            match re.captures(text) {
                Some(caps) => {
                    section.keyword = caps.name("keyword").map(|m| m.as_str().to_string());
                    section.priority = caps.name("priority").and_then(|m| Priority::parse(m.as_str()));
                    section.title = caps
                        .name("title")
                        .map(|m| m.as_str().trim_end().to_string())
                        .filter(|t| !t.is_empty());
                    if let Some(tags) = caps.name("tags") {
                        section.tags = tags
                            .as_str()
                            .split(':')
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect();
                    }
                }
                None => section.title = Some(text.to_string()).filter(|t| !t.is_empty()),
            }
            section
        }

        pub fn add_content(&mut self, node: Node) {
            self.content.push(node);
        }

        pub fn remove_content(&mut self, at: usize) -> Option<Node> {
            if at < self.content.len() {
                Some(self.content.remove(at))
            } else {
                None
            }
        }

        /// Inserts `node` at `at`; ignored when `at` is past the end.
        pub fn insert_content(&mut self, node: Node, at: usize) {
            if at <= self.content.len() {
                self.content.insert(at, node);
            }
        }

        pub fn lists(&self) -> Vec<&List> {
            self.content
                .iter()
                .filter_map(|node| match node {
                    Node::List(list) => Some(list),
                    _ => None,
                })
                .collect()
        }

        pub fn find_list(&self, at: usize) -> Option<&List> {
            match self.content.get(at)? {
                Node::List(list) => Some(list),
                _ => None,
            }
        }

        pub fn drawers(&self) -> Vec<&Drawer> {
            self.content
                .iter()
                .filter_map(|node| match node {
                    Node::Drawer(drawer) => Some(drawer),
                    _ => None,
                })
                .collect()
        }

        /// First planning entry of the section, if any.
        pub fn planning(&self) -> Option<&Planning> {
            self.content.iter().find_map(|node| match node {
                Node::Planning(planning) => Some(planning),
                _ => None,
            })
        }

        pub fn child_section_ids(&self) -> impl Iterator<Item = SectionId> + '_ {
            self.content.iter().filter_map(Node::section_id)
        }
    }

    /// `KEYWORD? [#P]? title :tags:?`, anchored on the whole headline text.
    fn headline_title_pattern(todos: &[String]) -> String {
        let keywords: Vec<String> = todos
            .iter()
            .filter(|k| !k.is_empty())
            .map(|k| regex::escape(k))
            .collect();
        let keyword = if keywords.is_empty() {
            String::new()
        } else {
            format!(r"(?:(?P<keyword>{})(?:\s+|$))?", keywords.join("|"))
        };
        format!(
            r"^{keyword}(?:\[#(?P<priority>[ABCabc])\](?:\s+|$))?(?P<title>.*?)(?:\s+(?P<tags>(?::[^\s:]+)+:))?\s*$"
        )
    }

    /// Consecutive text lines.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Paragraph {
        pub lines: Vec<String>,
    }

    /// A run of list items sharing one indentation.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct List {
        pub items: Vec<ListItem>,
    }

    impl List {
        pub fn is_ordered(&self) -> bool {
            self.items
                .first()
                .is_some_and(|item| item.marker.starts_with(|c: char| c.is_ascii_digit()))
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListItem {
        /// `-`, `+`, `*`, `1.` or `1)` as written.
        pub marker: String,
        pub checkbox: Option<Checkbox>,
        /// The item's text paragraph, continuation lines and nested lists.
        pub content: Vec<Node>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum Checkbox {
        Empty,   // [ ]
        Partial, // [-]
        Checked, // [X]
    }

    impl Checkbox {
        pub fn from_mark(mark: &str) -> Option<Self> {
            match mark {
                " " => Some(Checkbox::Empty),
                "-" => Some(Checkbox::Partial),
                "x" | "X" => Some(Checkbox::Checked),
                _ => None,
            }
        }

        pub fn mark(self) -> char {
            match self {
                Checkbox::Empty => ' ',
                Checkbox::Partial => '-',
                Checkbox::Checked => 'X',
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
    pub struct Table {
        pub rows: Vec<TableRow>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum TableRow {
        Cells(Vec<String>),
        Rule,
    }

    impl Table {
        pub fn column_count(&self) -> usize {
            self.rows
                .iter()
                .map(|row| match row {
                    TableRow::Cells(cells) => cells.len(),
                    TableRow::Rule => 0,
                })
                .max()
                .unwrap_or(0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Drawer {
        pub name: String,
        pub lines: Vec<DrawerLine>,
    }

    impl Drawer {
        pub fn property(&self, key: &str) -> Option<&str> {
            self.lines.iter().find_map(|line| match line {
                DrawerLine::Property { key: k, value } if k.eq_ignore_ascii_case(key) => {
                    Some(value.as_str())
                }
                _ => None,
            })
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum DrawerLine {
        Property { key: String, value: String },
        Raw(String),
    }

    /// `SCHEDULED:`, `DEADLINE:` or `CLOSED:` with its timestamp.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Planning {
        pub keyword: PlanningKeyword,
        pub timestamp: Option<Timestamp>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum PlanningKeyword {
        Scheduled,
        Deadline,
        Closed,
    }

    impl PlanningKeyword {
        pub fn as_str(self) -> &'static str {
            match self {
                PlanningKeyword::Scheduled => "SCHEDULED",
                PlanningKeyword::Deadline => "DEADLINE",
                PlanningKeyword::Closed => "CLOSED",
            }
        }

        pub fn from_keyword(s: &str) -> Option<Self> {
            match s {
                "SCHEDULED" => Some(PlanningKeyword::Scheduled),
                "DEADLINE" => Some(PlanningKeyword::Deadline),
                "CLOSED" => Some(PlanningKeyword::Closed),
                _ => None,
            }
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Footnote {
        pub label: String,
        pub content: Vec<Node>,
    }

    /// `#+BEGIN_KIND params` ... `#+END_KIND`, body kept verbatim.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Block {
        /// Uppercased kind, e.g. `SRC`, `EXAMPLE`, `QUOTE`.
        pub kind: String,
        pub params: Option<String>,
        pub lines: Vec<String>,
    }

    impl Block {
        /// Language of a `SRC` block: the first parameter word.
        pub fn language(&self) -> Option<&str> {
            if self.kind != "SRC" {
                return None;
            }
            self.params.as_deref()?.split_whitespace().next()
        }
    }

    /* ---------------------------- Value Objects ---------------------------- */

    /// A timestamp with optional time range, repeater and warning delay.
    ///
    /// Active timestamps are written `<...>`, inactive ones `[...]`. The day name is not
    /// stored; it is derived from `date` when rendering.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Timestamp {
        pub active: bool,
        pub date: NaiveDate,
        pub time: Option<NaiveTime>,
        /// End of a same-day range such as `10:00-11:30`.
        pub end_time: Option<NaiveTime>,
        /// Repeater cookie (`+1w`, `++1m`, `.+2d`).
        pub repeater: Option<Repeater>,
        /// Warning delay cookie (`-2d`).
        pub delay: Option<Interval>,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct Repeater {
        pub kind: RepeaterKind,
        pub interval: Interval,
    }

    /// `+` (from last closed), `++` (from base), `.+` (from now).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum RepeaterKind {
        FromLast, // `+`
        FromBase, // `++`
        FromNow,  // `.+`
    }

    impl RepeaterKind {
        pub fn as_str(self) -> &'static str {
            match self {
                RepeaterKind::FromLast => "+",
                RepeaterKind::FromBase => "++",
                RepeaterKind::FromNow => ".+",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub struct Interval {
        pub value: u32,
        pub unit: IntervalUnit,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
    pub enum IntervalUnit {
        Hour,
        Day,
        Week,
        Month,
        Year,
    }

    impl IntervalUnit {
        pub fn from_char(c: char) -> Option<Self> {
            match c {
                'h' => Some(IntervalUnit::Hour),
                'd' => Some(IntervalUnit::Day),
                'w' => Some(IntervalUnit::Week),
                'm' => Some(IntervalUnit::Month),
                'y' => Some(IntervalUnit::Year),
                _ => None,
            }
        }

        pub fn as_char(self) -> char {
            match self {
                IntervalUnit::Hour => 'h',
                IntervalUnit::Day => 'd',
                IntervalUnit::Week => 'w',
                IntervalUnit::Month => 'm',
                IntervalUnit::Year => 'y',
            }
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    /// Why a structural edit was not applied. The document is unchanged whenever one of
    /// these is returned.
    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum MoveError {
        #[error("no section at index {0}")]
        SectionNotFound(OrgIndex),
        #[error("content position {index} is out of range ({len} nodes)")]
        ContentOutOfRange { index: usize, len: usize },
        #[error("top-level position {index} is out of range ({len} nodes)")]
        TopLevelOutOfRange { index: usize, len: usize },
        #[error("node at position {0} is not a section")]
        NotASection(usize),
        #[error("a level {moved} section cannot be placed under a level {parent} section")]
        LevelMismatch { moved: usize, parent: usize },
        #[error("no subsection titled {0:?}")]
        SubsectionNotFound(String),
        #[error("section {0:?} is already attached to the tree")]
        AlreadyAttached(SectionId),
        #[error("no section {0:?} in this document")]
        UnknownSection(SectionId),
    }

}

pub mod patterns {
    //! Memoized regex compilation keyed by pattern text.
    //!
    //! The cache is an explicit object handed to the tokenizer and parser; share it with an
    //! `Arc` to let several parsers reuse compiled patterns. Reads take a shared lock, a miss
    //! compiles outside the lock and inserts under the write lock. Two threads missing on the
    //! same pattern may both compile it; the first insert wins and both see equivalent regexes.

    use regex::Regex;
    use std::{
        collections::HashMap,
        sync::{Arc, PoisonError, RwLock},
    };
    use tracing::debug;

    #[derive(Debug, Default)]
    pub struct PatternCache {
        compiled: RwLock<HashMap<String, Arc<Regex>>>,
    }

    impl PatternCache {
        pub fn new() -> Self {
            Self::default()
        }

        /// Compiles (or fetches) `pattern`, surfacing syntax errors.
        pub fn try_compile(&self, pattern: &str) -> Result<Arc<Regex>, regex::Error> {
            if let Some(re) = self
                .compiled
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(pattern)
            {
                return Ok(Arc::clone(re));
            }

            let re = Arc::new(Regex::new(pattern)?);
            debug!(pattern, "compiled pattern");
            let mut table = self
                .compiled
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            Ok(Arc::clone(table.entry(pattern.to_string()).or_insert(re)))
        }

        /// Compiles (or fetches) a built-in pattern.
        ///
        /// # Panics
        ///
        /// Panics if `pattern` is not a valid regex. Every pattern the crate passes here is a
        /// constant or is assembled from escaped input.
        pub fn compile(&self, pattern: &str) -> Arc<Regex> {
            self.try_compile(pattern)
                .unwrap_or_else(|err| panic!("invalid built-in pattern {pattern:?}: {err}"))
        }

        /// Captured groups of the first match, group 0 included; unmatched optional groups
        /// are `None`. `None` when the text does not match at all.
        pub fn captures(&self, pattern: &str, text: &str) -> Option<Vec<Option<String>>> {
            let re = self.compile(pattern);
            let caps = re.captures(text)?;
            Some(
                caps.iter()
                    .map(|group| group.map(|m| m.as_str().to_string()))
                    .collect(),
            )
        }

        pub fn is_match(&self, pattern: &str, text: &str) -> bool {
            self.compile(pattern).is_match(text)
        }

        /// Number of distinct patterns compiled so far.
        pub fn len(&self) -> usize {
            self.compiled
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

}

pub mod config {
    //! Parser configuration.

    use anyhow::{Context, Result};
    use serde::{Deserialize, Serialize};
    use std::{fs, path::Path};

    /// Settings the caller supplies before parsing.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ParserConfig {
        /// TODO keyword groups used when a document has no `#+TODO:` line.
        /// Example: [["TODO","NEXT"],["DONE"]]
        #[serde(default = "ParserConfig::default_todos")]
        pub default_todos: Vec<Vec<String>>,
    }

    impl Default for ParserConfig {
        fn default() -> Self {
            Self {
                default_todos: Self::default_todos(),
            }
        }
    }

    impl ParserConfig {
        fn default_todos() -> Vec<Vec<String>> {
            vec![vec!["TODO".to_string()], vec!["DONE".to_string()]]
        }

        /// Reads a JSON config such as `{"default_todos": [["TODO"], ["DONE"]]}`.
        pub fn from_json_file(path: &Path) -> Result<Self> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
            serde_json::from_str(&text).with_context(|| format!("decoding config {:?}", path))
        }

        /// Replaces the default groups with a `#+TODO:`-style line (`TODO NEXT | DONE`).
        pub fn with_todo_line(mut self, line: &str) -> Self {
            self.default_todos = crate::core::parse_todo_groups(line);
            self
        }
    }

}

pub mod lexer {
    //! Line classification.
    //!
    //! Each source line becomes one [`Token`] (a planning line naming several keywords
    //! becomes one token per keyword). Classification is first-match-wins in this order:
    //! blank, setting, block begin/end, headline, planning, drawer end/begin, footnote
    //! definition, horizontal rule, comment, table rule/row, list item, plain text.
    //! Multi-line constructs are left to the parser; unrecognized lines are plain text.

    use crate::core::{Checkbox, Interval, IntervalUnit, PlanningKeyword, Repeater, RepeaterKind, Timestamp};
    use crate::patterns::PatternCache;
    use chrono::{NaiveDate, NaiveTime};
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{tag, take_while_m_n, take_while1},
        character::complete::{char, digit1, one_of, space0, space1},
        combinator::{map_res, opt},
        error::VerboseError,
        sequence::{preceded, tuple},
    };
    use std::collections::VecDeque;
    use tracing::trace;

    /// Line grammar shared by the tokenizer and the parser's assemblers.
    pub(crate) mod grammar {
        pub const BLANK: &str = r"^\s*$";
        pub const SETTING: &str = r"^\s*#\+([A-Za-z][A-Za-z0-9_-]*):\s*(.*?)\s*$";
        pub const BLOCK_BEGIN: &str = r"(?i)^\s*#\+begin_(\S+)(?:\s+(.*?))?\s*$";
        pub const BLOCK_END: &str = r"(?i)^\s*#\+end_(\S+)\s*$";
        pub const HEADLINE: &str = r"^(\*+)\s+(.*?)\s*$";
        pub const PLANNING_LINE: &str = r"^\s*(?:SCHEDULED|DEADLINE|CLOSED):";
        pub const PLANNING_KEYWORD: &str = r"\b(SCHEDULED|DEADLINE|CLOSED):";
        pub const DRAWER_END: &str = r"(?i)^\s*:END:\s*$";
        pub const DRAWER_BEGIN: &str = r"^\s*:([A-Za-z][A-Za-z0-9_-]*):\s*$";
        pub const PROPERTY: &str = r"^\s*:([^:\s]+):(?:\s+(.*?))?\s*$";
        pub const FOOTNOTE: &str = r"^\s*\[fn:([^\]\s]+)\]\s*(.*?)\s*$";
        pub const HORIZONTAL_RULE: &str = r"^\s*-{3,}\s*$";
        pub const COMMENT: &str = r"^\s*#(?:\s+(.*?))?\s*$";
        pub const TABLE_RULE: &str = r"^\s*\|-[-+|]*\s*$";
        pub const TABLE_ROW: &str = r"^\s*\|(.*)\|\s*$";
        pub const LIST_ITEM: &str =
            r"^(\s*)([-+*]|\d+[.)])\s+(?:\[([ xX-])\](?:\s+|$))?(.*?)\s*$";
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Token {
        Blank,
        Setting { key: String, value: String },
        Headline { level: usize, text: String },
        Planning { keyword: PlanningKeyword, timestamp: Option<Timestamp> },
        /// `kind` is uppercased.
        BlockBegin { kind: String, params: Option<String> },
        BlockEnd { kind: String },
        Comment(String),
        HorizontalRule,
        ListItem(ListMarker),
        DrawerBegin(String),
        DrawerEnd,
        FootnoteDefinition { label: String, text: String },
        TableRow(Vec<String>),
        TableRule,
        /// Plain text, surrounding whitespace trimmed.
        Text(String),
    }

    /// Marker information of a list item line.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ListMarker {
        /// Leading whitespace width.
        pub indent: usize,
        pub marker: String,
        pub checkbox: Option<Checkbox>,
        pub text: String,
    }

    /// A token together with where it came from.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct TokenLine {
        /// 1-based source line number.
        pub line: usize,
        pub raw: String,
        pub token: Token,
    }

    impl TokenLine {
        pub fn indent(&self) -> usize {
            indent_of(&self.raw)
        }
    }

    pub(crate) fn indent_of(raw: &str) -> usize {
        raw.chars().take_while(|c| c.is_whitespace()).count()
    }

    /// Classifies one line. Always returns at least one token.
    pub fn classify_line(line: &str, patterns: &PatternCache) -> Vec<Token> {
        use grammar::*;

        if patterns.is_match(BLANK, line) {
            return vec![Token::Blank];
        }
        if let Some(m) = patterns.captures(SETTING, line) {
            return vec![Token::Setting {
                key: group(&m, 1),
                value: group(&m, 2),
            }];
        }
        if let Some(m) = patterns.captures(BLOCK_BEGIN, line) {
            return vec![Token::BlockBegin {
                kind: group(&m, 1).to_ascii_uppercase(),
                params: m.get(2).cloned().flatten().filter(|p| !p.is_empty()),
            }];
        }
        if let Some(m) = patterns.captures(BLOCK_END, line) {
            return vec![Token::BlockEnd {
                kind: group(&m, 1).to_ascii_uppercase(),
            }];
        }
        if let Some(m) = patterns.captures(HEADLINE, line) {
            return vec![Token::Headline {
                level: group(&m, 1).len(),
                text: group(&m, 2),
            }];
        }
        if patterns.is_match(PLANNING_LINE, line) {
            return planning_tokens(line, patterns);
        }
        if patterns.is_match(DRAWER_END, line) {
            return vec![Token::DrawerEnd];
        }
        if let Some(m) = patterns.captures(DRAWER_BEGIN, line) {
            return vec![Token::DrawerBegin(group(&m, 1))];
        }
        if let Some(m) = patterns.captures(FOOTNOTE, line) {
            return vec![Token::FootnoteDefinition {
                label: group(&m, 1),
                text: group(&m, 2),
            }];
        }
        if patterns.is_match(HORIZONTAL_RULE, line) {
            return vec![Token::HorizontalRule];
        }
        if let Some(m) = patterns.captures(COMMENT, line) {
            return vec![Token::Comment(group(&m, 1))];
        }
        if patterns.is_match(TABLE_RULE, line) {
            return vec![Token::TableRule];
        }
        if let Some(m) = patterns.captures(TABLE_ROW, line) {
            let cells = group(&m, 1)
                .split('|')
                .map(|cell| cell.trim().to_string())
                .collect();
            return vec![Token::TableRow(cells)];
        }
        if let Some(m) = patterns.captures(LIST_ITEM, line) {
            return vec![Token::ListItem(ListMarker {
                indent: indent_of(&group(&m, 1)),
                marker: group(&m, 2),
                checkbox: m
                    .get(3)
                    .cloned()
                    .flatten()
                    .and_then(|mark| Checkbox::from_mark(&mark)),
                text: group(&m, 4),
            })];
        }
        vec![Token::Text(line.trim().to_string())]
    }

    fn group(groups: &[Option<String>], n: usize) -> String {
        groups.get(n).cloned().flatten().unwrap_or_default()
    }

    /// One token per keyword, each with the timestamp text that follows it.
    fn planning_tokens(line: &str, patterns: &PatternCache) -> Vec<Token> {
        let re = patterns.compile(grammar::PLANNING_KEYWORD);
        let marks: Vec<(PlanningKeyword, usize, usize)> = re
            .captures_iter(line)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let keyword = PlanningKeyword::from_keyword(caps.get(1)?.as_str())?;
                Some((keyword, whole.start(), whole.end()))
            })
            .collect();

        let mut tokens = Vec::with_capacity(marks.len());
        for (n, (keyword, _, end)) in marks.iter().enumerate() {
            let stop = marks.get(n + 1).map(|m| m.1).unwrap_or(line.len());
            let timestamp = parse_timestamp(line[*end..stop].trim());
            tokens.push(Token::Planning {
                keyword: *keyword,
                timestamp,
            });
        }
        if tokens.is_empty() {
            tokens.push(Token::Text(line.trim().to_string()));
        }
        tokens
    }

    /* ------------------------------ Tokenizer ------------------------------ */

    /// Pull-based token stream over a sequence of lines.
    pub struct Tokenizer<'a> {
        lines: std::vec::IntoIter<String>,
        line_no: usize,
        pending: VecDeque<TokenLine>,
        patterns: &'a PatternCache,
    }

    impl<'a> Tokenizer<'a> {
        pub fn new(lines: Vec<String>, patterns: &'a PatternCache) -> Self {
            Self {
                lines: lines.into_iter(),
                line_no: 0,
                pending: VecDeque::new(),
                patterns,
            }
        }

        pub fn from_text(text: &str, patterns: &'a PatternCache) -> Self {
            Self::new(text.lines().map(str::to_string).collect(), patterns)
        }

        /// Next token without consuming it.
        pub fn peek(&mut self) -> Option<&TokenLine> {
            self.fill();
            self.pending.front()
        }

        pub fn dequeue(&mut self) -> Option<TokenLine> {
            self.fill();
            self.pending.pop_front()
        }

        fn fill(&mut self) {
            while self.pending.is_empty() {
                let Some(raw) = self.lines.next() else {
                    return;
                };
                self.line_no += 1;
                for token in classify_line(&raw, self.patterns) {
                    trace!(line = self.line_no, ?token, "token");
                    self.pending.push_back(TokenLine {
                        line: self.line_no,
                        raw: raw.clone(),
                        token,
                    });
                }
            }
        }
    }

    impl Iterator for Tokenizer<'_> {
        type Item = TokenLine;

        fn next(&mut self) -> Option<TokenLine> {
            self.dequeue()
        }
    }

    /* ----------------------------- Timestamps ----------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    /// Parses a timestamp at the start of `text`; trailing text is ignored.
    pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
        timestamp(text).ok().map(|(_, ts)| ts)
    }

    fn timestamp(i: &str) -> PResult<'_, Timestamp> {
        // Active: <YYYY-MM-DD [Day] [HH:MM[-HH:MM]] [+1w] [-2d]>
        // Inactive: [YYYY-MM-DD ...]
        let (i, open) = one_of("<[")(i)?;
        let active = open == '<';
        let (i, date) = parse_date(i)?;
        let (i, _day) = opt(preceded(space1, take_while1(|c: char| c.is_alphabetic())))(i)?;
        let (i, times) = opt(preceded(space1, time_range))(i)?;
        let (i, repeater) = opt(preceded(space1, repeater))(i)?;
        let (i, delay) = opt(preceded(space1, preceded(char('-'), interval)))(i)?;
        let (i, _) = space0(i)?;
        let (i, _) = char(if active { '>' } else { ']' })(i)?;
        let (time, end_time) = match times {
            Some((start, end)) => (Some(start), end),
            None => (None, None),
        };
        Ok((
            i,
            Timestamp {
                active,
                date,
                time,
                end_time,
                repeater,
                delay,
            },
        ))
    }

    fn parse_date(i: &str) -> PResult<'_, NaiveDate> {
        map_res(
            tuple((
                map_res(take_while_m_n(4, 4, char_is_digit), |s: &str| {
                    s.parse::<i32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char('-'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(y, _, m, _, d)| NaiveDate::from_ymd_opt(y, m, d).ok_or("invalid date"),
        )(i)
    }

    fn parse_time(i: &str) -> PResult<'_, NaiveTime> {
        map_res(
            tuple((
                map_res(take_while_m_n(1, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
                char(':'),
                map_res(take_while_m_n(2, 2, char_is_digit), |s: &str| {
                    s.parse::<u32>()
                }),
            )),
            |(h, _, m)| NaiveTime::from_hms_opt(h, m, 0).ok_or("invalid time"),
        )(i)
    }

    fn char_is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn time_range(i: &str) -> PResult<'_, (NaiveTime, Option<NaiveTime>)> {
        let (i, start) = parse_time(i)?;
        let (i, end) = opt(preceded(char('-'), parse_time))(i)?;
        Ok((i, (start, end)))
    }

    fn repeater(i: &str) -> PResult<'_, Repeater> {
        let (i, mark) = alt((tag(".+"), tag("++"), tag("+")))(i)?;
        let kind = match mark {
            ".+" => RepeaterKind::FromNow,
            "++" => RepeaterKind::FromBase,
            _ => RepeaterKind::FromLast,
        };
        let (i, interval) = interval(i)?;
        Ok((i, Repeater { kind, interval }))
    }

    fn interval(i: &str) -> PResult<'_, Interval> {
        let (i, value) = map_res(digit1, |s: &str| s.parse::<u32>())(i)?;
        let (i, unit) = map_res(one_of("hdwmy"), |c| IntervalUnit::from_char(c).ok_or("unit"))(i)?;
        Ok((i, Interval { value, unit }))
    }

}

pub mod parser {
    //! Recursive-descent parser: one call frame per outline depth, threading the current
    //! [`OrgIndex`]. Parsing never fails; malformed constructs degrade to the closest
    //! well-formed node.

    use crate::config::ParserConfig;
    use crate::core::*;
    use crate::lexer::{ListMarker, Token, TokenLine, Tokenizer, grammar};
    use crate::patterns::PatternCache;
    use std::sync::Arc;
    use tracing::debug;

    #[derive(Debug, Clone, Default)]
    pub struct OrgParser {
        patterns: Arc<PatternCache>,
        config: ParserConfig,
    }

    impl OrgParser {
        pub fn new(config: ParserConfig) -> Self {
            Self::with_patterns(config, Arc::new(PatternCache::new()))
        }

        /// Parser reusing an existing pattern cache.
        pub fn with_patterns(config: ParserConfig, patterns: Arc<PatternCache>) -> Self {
            Self { patterns, config }
        }

        pub fn patterns(&self) -> &Arc<PatternCache> {
            &self.patterns
        }

        pub fn config(&self) -> &ParserConfig {
            &self.config
        }

        pub fn parse(&self, text: &str) -> Document {
            self.parse_lines(text.lines())
        }

        pub fn parse_lines<I, S>(&self, lines: I) -> Document
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            let lines: Vec<String> = lines.into_iter().map(Into::into).collect();
            let line_count = lines.len();
            let defaults = Document::new(self.config.default_todos.clone()).todo_keywords();
            let mut doc = self.run(lines.clone(), defaults.clone());

            // a `#+TODO:` line applies to every headline of the file, wherever it sits
            let file_todos = doc.todo_keywords();
            if file_todos != defaults {
                debug!(keywords = ?file_todos, "re-reading headlines with file TODO keywords");
                doc = self.run(lines, file_todos);
            }
            debug!(
                lines = line_count,
                sections = doc.sections().count(),
                settings = doc.settings.len(),
                "parsed document"
            );
            doc
        }

        fn run(&self, lines: Vec<String>, todos: Vec<String>) -> Document {
            ParseRun {
                tokens: Tokenizer::new(lines, &self.patterns),
                patterns: &self.patterns,
                doc: Document::new(self.config.default_todos.clone()),
                todos,
            }
            .parse_document()
        }
    }

    /// State of one parse pass.
    struct ParseRun<'a> {
        tokens: Tokenizer<'a>,
        patterns: &'a PatternCache,
        doc: Document,
        /// Flat keyword list used to decompose headlines.
        todos: Vec<String>,
    }

    impl ParseRun<'_> {
        fn parse_document(mut self) -> Document {
            let mut index = OrgIndex::root();
            while let Some(node) = self.parse_node(&index, 1) {
                self.doc.content.push(node);
                index = index.next();
            }
            self.doc
        }

        /// Next node at `index`, or `None` at end of input or when the next headline is
        /// shallower than `boundary`. Blank lines are skipped and settings recorded.
        fn parse_node(&mut self, index: &OrgIndex, boundary: usize) -> Option<Node> {
            loop {
                if let Token::Headline { level, .. } = self.tokens.peek()?.token {
                    if level < boundary {
                        return None;
                    }
                }
                let line = self.tokens.dequeue()?;
                let node = match line.token {
                    Token::Blank => continue,
                    Token::Setting { key, value } => {
                        self.doc.settings.insert(key, value);
                        continue;
                    }
                    Token::Headline { level, text } => {
                        Node::Section(self.parse_headline(index, level, &text))
                    }
                    Token::FootnoteDefinition { label, text } => self.parse_footnote(label, text),
                    Token::Text(text) => self.collect_paragraph(vec![text]),
                    Token::ListItem(marker) => Node::List(self.collect_list(marker, None)),
                    Token::TableRow(cells) => self.collect_table(TableRow::Cells(cells)),
                    Token::TableRule => self.collect_table(TableRow::Rule),
                    Token::DrawerBegin(name) => self.collect_drawer(name, line.line),
                    Token::BlockBegin { kind, params } => {
                        self.collect_block(kind, params, line.line)
                    }
                    Token::Planning { keyword, timestamp } => {
                        Node::Planning(Planning { keyword, timestamp })
                    }
                    Token::Comment(text) => Node::Comment(text),
                    Token::HorizontalRule => Node::HorizontalRule,
                    Token::DrawerEnd | Token::BlockEnd { .. } => {
                        debug!(line = line.line, "stray end marker kept as text");
                        self.collect_paragraph(vec![line.raw.trim().to_string()])
                    }
                };
                return Some(node);
            }
        }

        /// Allocates the section before its children so arena order is pre-order.
        fn parse_headline(&mut self, index: &OrgIndex, level: usize, text: &str) -> SectionId {
            let raw_title = Some(text).filter(|t| !t.is_empty());
            let mut section = Section::new(level, raw_title, &self.todos, self.patterns);
            section.index = Some(index.clone());
            let id = self.doc.add_section(section);

            let mut child = index.descend();
            while let Some(node) = self.parse_node(&child, level + 1) {
                self.doc.arena_mut(id).content.push(node);
                child = child.next();
            }
            id
        }

        fn parse_footnote(&mut self, label: String, text: String) -> Node {
            let mut lines = vec![];
            if !text.is_empty() {
                lines.push(text);
            }
            while let Some(Token::Text(_)) = self.tokens.peek().map(|t| &t.token) {
                if let Some(TokenLine {
                    token: Token::Text(text),
                    ..
                }) = self.tokens.dequeue()
                {
                    lines.push(text);
                }
            }
            let content = if lines.is_empty() {
                vec![]
            } else {
                vec![Node::Paragraph(Paragraph { lines })]
            };
            Node::Footnote(Footnote { label, content })
        }

        fn collect_paragraph(&mut self, mut lines: Vec<String>) -> Node {
            while let Some(Token::Text(_)) = self.tokens.peek().map(|t| &t.token) {
                if let Some(TokenLine {
                    token: Token::Text(text),
                    ..
                }) = self.tokens.dequeue()
                {
                    lines.push(text);
                }
            }
            Node::Paragraph(Paragraph { lines })
        }

        /// Items sharing the first item's indentation. A blank line ends the list.
        ///
        /// A nested list (`parent` is the owning item's indent) also takes items that are
        /// shallower than its first one but still deeper than the owning item.
        fn collect_list(&mut self, first: ListMarker, parent: Option<usize>) -> List {
            let indent = first.indent;
            let mut items = vec![self.start_item(first)];
            loop {
                let sibling = match self.tokens.peek().map(|t| &t.token) {
                    Some(Token::ListItem(next)) => match parent {
                        Some(parent) => next.indent > parent && next.indent <= indent,
                        None => next.indent == indent,
                    },
                    _ => false,
                };
                if !sibling {
                    break;
                }
                if let Some(TokenLine {
                    token: Token::ListItem(next),
                    ..
                }) = self.tokens.dequeue()
                {
                    items.push(self.start_item(next));
                }
            }
            List { items }
        }

        /// One item: its own text, deeper-indented continuation lines and nested lists.
        fn start_item(&mut self, marker: ListMarker) -> ListItem {
            let indent = marker.indent;
            let mut content = vec![];
            if !marker.text.is_empty() {
                content.push(Node::Paragraph(Paragraph {
                    lines: vec![marker.text],
                }));
            }

            loop {
                let deeper = match self.tokens.peek() {
                    Some(line) => match &line.token {
                        Token::Text(_) => line.indent() > indent,
                        Token::ListItem(nested) => nested.indent > indent,
                        _ => false,
                    },
                    None => false,
                };
                if !deeper {
                    break;
                }
                let Some(line) = self.tokens.dequeue() else {
                    break;
                };
                match line.token {
                    Token::Text(text) => match content.last_mut() {
                        Some(Node::Paragraph(paragraph)) => paragraph.lines.push(text),
                        _ => content.push(Node::Paragraph(Paragraph { lines: vec![text] })),
                    },
                    Token::ListItem(nested) => {
                        content.push(Node::List(self.collect_list(nested, Some(indent))))
                    }
                    _ => {}
                }
            }

            ListItem {
                marker: marker.marker,
                checkbox: marker.checkbox,
                content,
            }
        }

        fn collect_table(&mut self, first: TableRow) -> Node {
            let mut rows = vec![first];
            loop {
                let row = match self.tokens.peek().map(|t| &t.token) {
                    Some(Token::TableRow(cells)) => TableRow::Cells(cells.clone()),
                    Some(Token::TableRule) => TableRow::Rule,
                    _ => break,
                };
                self.tokens.dequeue();
                rows.push(row);
            }
            Node::Table(Table { rows })
        }

        /// Body lines up to `:END:`. An unterminated drawer stops at the next headline.
        fn collect_drawer(&mut self, name: String, opened_at: usize) -> Node {
            let mut lines = vec![];
            let mut last_line = opened_at;
            loop {
                match self.tokens.peek().map(|t| &t.token) {
                    None | Some(Token::Headline { .. }) => {
                        debug!(drawer = %name, line = opened_at, "unterminated drawer");
                        break;
                    }
                    Some(Token::DrawerEnd) => {
                        self.tokens.dequeue();
                        break;
                    }
                    Some(_) => {}
                }
                let Some(line) = self.tokens.dequeue() else {
                    break;
                };
                // a planning line can yield several tokens; keep its text once
                if line.line == last_line {
                    continue;
                }
                last_line = line.line;
                lines.push(self.drawer_line(&line.raw));
            }
            Node::Drawer(Drawer { name, lines })
        }

        fn drawer_line(&self, raw: &str) -> DrawerLine {
            match self.patterns.captures(grammar::PROPERTY, raw) {
                Some(groups) => DrawerLine::Property {
                    key: groups.get(1).cloned().flatten().unwrap_or_default(),
                    value: groups.get(2).cloned().flatten().unwrap_or_default(),
                },
                None => DrawerLine::Raw(raw.trim().to_string()),
            }
        }

        /// Verbatim body lines up to the matching `#+END_<kind>`. An end marker of another
        /// kind is body text; an unterminated block stops at the next headline.
        fn collect_block(&mut self, kind: String, params: Option<String>, opened_at: usize) -> Node {
            let mut lines = vec![];
            let mut last_line = opened_at;
            loop {
                match self.tokens.peek().map(|t| &t.token) {
                    None | Some(Token::Headline { .. }) => {
                        debug!(block = %kind, line = opened_at, "unterminated block");
                        break;
                    }
                    Some(Token::BlockEnd { kind: end }) if *end == kind => {
                        self.tokens.dequeue();
                        break;
                    }
                    Some(_) => {}
                }
                let Some(line) = self.tokens.dequeue() else {
                    break;
                };
                if line.line == last_line {
                    continue;
                }
                last_line = line.line;
                lines.push(line.raw);
            }
            Node::Block(Block {
                kind,
                params,
                lines,
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::HashSet;

        fn parse(text: &str) -> Document {
            OrgParser::default().parse(text)
        }

        fn top_section(doc: &Document, at: usize) -> &Section {
            let id = doc.content[at].section_id().expect("section");
            doc.section(id).expect("arena entry")
        }

        #[test]
        fn headline_with_keyword_priority_and_tags() {
            let doc = parse("* TODO [#A] Fix bug :work:urgent:\n  body text\n");
            assert_eq!(doc.content.len(), 1);
            let section = top_section(&doc, 0);
            assert_eq!(section.keyword.as_deref(), Some("TODO"));
            assert_eq!(section.priority, Some(Priority('A')));
            assert_eq!(section.title.as_deref(), Some("Fix bug"));
            assert_eq!(section.tags, vec!["work", "urgent"]);
            assert_eq!(
                section.content,
                vec![Node::Paragraph(Paragraph {
                    lines: vec!["body text".into()]
                })]
            );
        }

        #[test]
        fn nesting_follows_star_depth() {
            let doc = parse("* A\n** B\n* C\n");
            assert_eq!(doc.content.len(), 2);
            let a = top_section(&doc, 0);
            let c = top_section(&doc, 1);
            assert_eq!(a.index, OrgIndex::from_path(&[0]));
            assert_eq!(c.index, OrgIndex::from_path(&[1]));
            assert_eq!(c.title.as_deref(), Some("C"));

            let b_id = a.content[0].section_id().expect("B");
            let b = doc.section(b_id).expect("B");
            assert_eq!(b.title.as_deref(), Some("B"));
            assert_eq!(b.index, OrgIndex::from_path(&[0, 0]));
        }

        #[test]
        fn todo_setting_changes_keywords() {
            let doc = parse("#+TODO: TODO NEXT | DONE\n* NEXT do thing\n* NOTAKEYWORD thing\n");
            assert_eq!(doc.todos(), vec![vec!["TODO", "NEXT"], vec!["DONE"]]);
            let next = top_section(&doc, 0);
            assert_eq!(next.keyword.as_deref(), Some("NEXT"));
            assert_eq!(next.title.as_deref(), Some("do thing"));
            let other = top_section(&doc, 1);
            assert_eq!(other.keyword, None);
            assert_eq!(other.title.as_deref(), Some("NOTAKEYWORD thing"));
        }

        #[test]
        fn todo_setting_applies_to_earlier_headlines() {
            let doc = parse("* NEXT a\n#+TODO: NEXT | DONE\n* NEXT b\n");
            for at in 0..2 {
                assert_eq!(top_section(&doc, at).keyword.as_deref(), Some("NEXT"));
            }
            assert_eq!(top_section(&doc, 0).title.as_deref(), Some("a"));
            assert!(top_section(&doc, 0).content.is_empty());
            assert_eq!(parse(&doc.to_text()), doc);
        }

        #[test]
        fn indented_stars_stay_body_text() {
            let doc = parse("* A\n  ** not a heading\n:NOTES:\n  * starred\n:END:\n[fn:1] note\n   *** deep\n");
            let a = top_section(&doc, 0);
            assert_eq!(a.child_section_ids().count(), 0);
            assert_eq!(
                a.content[0],
                Node::Paragraph(Paragraph {
                    lines: vec!["** not a heading".into()]
                })
            );
            assert_eq!(doc.to_text().lines().nth(1), Some(" ** not a heading"));
            assert_eq!(parse(&doc.to_text()), doc);
        }

        #[test]
        fn star_bullets_stay_a_list() {
            let doc = parse("* A\n  * bullet\n    - inner\n  * other\n");
            let a = top_section(&doc, 0);
            assert!(matches!(&a.content[..], [Node::List(list)] if list.items.len() == 2));
            assert_eq!(doc.to_text(), "* A\n * bullet\n  - inner\n * other\n");
            assert_eq!(parse(&doc.to_text()), doc);
        }

        #[test]
        fn shallower_nested_item_joins_nested_list() {
            let doc = parse("- a\n    - b\n  - c\n- d\n");
            let Node::List(list) = &doc.content[0] else {
                panic!("expected list");
            };
            assert_eq!(list.items.len(), 2);
            let nested: Vec<&List> = list.items[0]
                .content
                .iter()
                .filter_map(|node| match node {
                    Node::List(inner) => Some(inner),
                    _ => None,
                })
                .collect();
            assert_eq!(nested.len(), 1);
            assert_eq!(nested[0].items.len(), 2);
            assert_eq!(parse(&doc.to_text()), doc);
        }

        #[test]
        fn config_supplies_default_keywords() {
            let parser = OrgParser::new(ParserConfig::default().with_todo_line("OPEN | SHUT"));
            let doc = parser.parse("* OPEN door\n* TODO thing\n");
            assert_eq!(top_section(&doc, 0).keyword.as_deref(), Some("OPEN"));
            assert_eq!(top_section(&doc, 1).keyword, None);
            assert!(doc.is_done_keyword("SHUT"));
        }

        #[test]
        fn settings_inside_sections_are_recorded() {
            let doc = parse("#+TITLE: Notes\n* A\n#+AUTHOR: someone\ntext\n");
            assert_eq!(doc.title(), Some("Notes"));
            assert_eq!(doc.setting("author"), Some("someone"));
            assert_eq!(top_section(&doc, 0).content.len(), 1);
        }

        #[test]
        fn paragraphs_count_toward_child_indexes() {
            let doc = parse("* A\nintro\n** B\n** C\n");
            let a = top_section(&doc, 0);
            assert_eq!(a.content.len(), 3);
            let c = doc
                .section(a.content[2].section_id().expect("C"))
                .expect("C");
            assert_eq!(c.index, OrgIndex::from_path(&[0, 2]));
        }

        #[test]
        fn drawer_with_properties() {
            let doc = parse("* A\n:PROPERTIES:\n:ID: abc\n:EMPTY:\nfree text\n:END:\nafter\n");
            let a = top_section(&doc, 0);
            match &a.content[0] {
                Node::Drawer(drawer) => {
                    assert_eq!(drawer.name, "PROPERTIES");
                    assert_eq!(drawer.property("id"), Some("abc"));
                    assert_eq!(drawer.property("EMPTY"), Some(""));
                    assert_eq!(drawer.lines[2], DrawerLine::Raw("free text".into()));
                }
                other => panic!("expected drawer, got {other:?}"),
            }
            assert_eq!(a.drawers().len(), 1);
            assert!(matches!(&a.content[1], Node::Paragraph(p) if p.lines == ["after"]));
        }

        #[test]
        fn unterminated_drawer_stops_at_headline() {
            let doc = parse("* A\n:LOGBOOK:\n- note\n* B\n");
            assert_eq!(doc.content.len(), 2);
            let a = top_section(&doc, 0);
            match &a.content[0] {
                Node::Drawer(drawer) => {
                    assert_eq!(drawer.lines, vec![DrawerLine::Raw("- note".into())]);
                }
                other => panic!("expected drawer, got {other:?}"),
            }
        }

        #[test]
        fn unterminated_block_runs_to_end_of_input() {
            let doc = parse("#+BEGIN_SRC rust\nfn main() {}\n#+END_EXAMPLE\n\n  indented");
            assert_eq!(doc.content.len(), 1);
            match &doc.content[0] {
                Node::Block(block) => {
                    assert_eq!(block.kind, "SRC");
                    assert_eq!(block.language(), Some("rust"));
                    assert_eq!(
                        block.lines,
                        vec!["fn main() {}", "#+END_EXAMPLE", "", "  indented"]
                    );
                }
                other => panic!("expected block, got {other:?}"),
            }
        }

        #[test]
        fn block_keeps_body_verbatim() {
            let doc = parse("#+begin_quote\n  - not a list\n| not | table |\n#+end_quote\ntail\n");
            assert_eq!(doc.content.len(), 2);
            match &doc.content[0] {
                Node::Block(block) => {
                    assert_eq!(block.kind, "QUOTE");
                    assert_eq!(block.params, None);
                    assert_eq!(block.lines, vec!["  - not a list", "| not | table |"]);
                }
                other => panic!("expected block, got {other:?}"),
            }
        }

        #[test]
        fn stray_end_marker_is_text() {
            let doc = parse(":END:\nmore\n#+END_SRC\n");
            assert_eq!(
                doc.content,
                vec![
                    Node::Paragraph(Paragraph {
                        lines: vec![":END:".into(), "more".into()]
                    }),
                    Node::Paragraph(Paragraph {
                        lines: vec!["#+END_SRC".into()]
                    }),
                ]
            );
        }

        #[test]
        fn nested_lists_and_continuations() {
            let doc = parse("- [ ] one\n  more of one\n  - inner\n- two\n\nafter\n");
            assert_eq!(doc.content.len(), 2);
            let Node::List(list) = &doc.content[0] else {
                panic!("expected list");
            };
            assert_eq!(list.items.len(), 2);
            let first = &list.items[0];
            assert_eq!(first.checkbox, Some(Checkbox::Empty));
            assert_eq!(
                first.content[0],
                Node::Paragraph(Paragraph {
                    lines: vec!["one".into(), "more of one".into()]
                })
            );
            let Node::List(inner) = &first.content[1] else {
                panic!("expected nested list");
            };
            assert_eq!(inner.items[0].marker, "-");
            assert!(!list.is_ordered());
        }

        #[test]
        fn ordered_list_of_differing_indent_nests() {
            let doc = parse("1. first\n2. second\n   1) sub\n");
            let Node::List(list) = &doc.content[0] else {
                panic!("expected list");
            };
            assert!(list.is_ordered());
            assert_eq!(list.items.len(), 2);
            assert!(matches!(list.items[1].content[1], Node::List(_)));
        }

        #[test]
        fn tables_collect_rows_and_rules() {
            let doc = parse("| a | b |\n|---+---|\n| 1 | 2 | 3 |\n");
            let Node::Table(table) = &doc.content[0] else {
                panic!("expected table");
            };
            assert_eq!(table.rows.len(), 3);
            assert_eq!(table.rows[1], TableRow::Rule);
            assert_eq!(table.column_count(), 3);
        }

        #[test]
        fn planning_footnotes_comments_and_rules() {
            let doc = parse(
                "* A\nSCHEDULED: <2024-05-01 Wed> DEADLINE: <2024-05-03 Fri>\n# remark\n-----\n[fn:1] note\ncontinued\n",
            );
            let a = top_section(&doc, 0);
            let kinds: Vec<&str> = a.content.iter().map(Node::kind_name).collect();
            assert_eq!(
                kinds,
                vec!["planning", "planning", "comment", "horizontal_rule", "footnote"]
            );
            assert_eq!(
                a.planning().map(|p| p.keyword),
                Some(PlanningKeyword::Scheduled)
            );
            let Node::Footnote(footnote) = &a.content[4] else {
                panic!("expected footnote");
            };
            assert_eq!(footnote.label, "1");
            assert_eq!(
                footnote.content,
                vec![Node::Paragraph(Paragraph {
                    lines: vec!["note".into(), "continued".into()]
                })]
            );
        }

        #[test]
        fn deeper_first_headline_is_still_top_level() {
            let doc = parse("*** deep\n* shallow\n");
            assert_eq!(doc.content.len(), 2);
            assert_eq!(top_section(&doc, 0).level, 3);
            assert_eq!(top_section(&doc, 1).index, OrgIndex::from_path(&[1]));
        }

        #[test]
        fn empty_headline_has_no_title() {
            let doc = parse("* \n");
            assert_eq!(doc.content.len(), 1);
            assert_eq!(top_section(&doc, 0).title, None);
        }

        #[test]
        fn parser_shares_pattern_cache() {
            let patterns = Arc::new(PatternCache::new());
            let a = OrgParser::with_patterns(ParserConfig::default(), Arc::clone(&patterns));
            let b = OrgParser::with_patterns(ParserConfig::default(), Arc::clone(&patterns));
            a.parse("* A\ntext\n");
            let compiled = patterns.len();
            b.parse("* B\nmore\n");
            assert_eq!(patterns.len(), compiled);
            assert!(Arc::ptr_eq(a.patterns(), b.patterns()));
        }

        fn outline() -> impl Strategy<Value = String> {
            let headline = (1usize..5, "[A-Za-z]{1,8}( [a-z]{1,6}){0,2}");
            let body = proptest::option::of("(  \\*{1,3} )?[a-z]{1,8}( [a-z]{1,8}){0,3}");
            prop::collection::vec((headline, body), 0..12).prop_map(|entries| {
                let mut text = String::new();
                for ((level, title), body) in entries {
                    text.push_str(&"*".repeat(level));
                    text.push(' ');
                    text.push_str(&title);
                    text.push('\n');
                    if let Some(body) = body {
                        text.push_str(&body);
                        text.push('\n');
                    }
                }
                text
            })
        }

        fn walk<'d>(doc: &'d Document, content: &'d [Node], out: &mut Vec<(&'d Section, usize)>, parent_level: usize) {
            for id in content.iter().filter_map(Node::section_id) {
                let section = doc.section(id).expect("attached section");
                out.push((section, parent_level));
                walk(doc, &section.content, out, section.level);
            }
        }

        proptest! {
            #[test]
            fn indexes_are_unique_and_nesting_holds(text in outline()) {
                let doc = parse(&text);
                let mut seen = vec![];
                walk(&doc, &doc.content, &mut seen, 0);
                let mut indexes = HashSet::new();
                for (section, parent_level) in &seen {
                    prop_assert!(section.level > *parent_level);
                    let index = section.index.clone().expect("parsed sections carry an index");
                    prop_assert!(indexes.insert(index));
                }
                prop_assert_eq!(seen.len(), text.lines().filter(|l| l.starts_with('*')).count());
            }

            #[test]
            fn render_then_parse_is_stable(text in outline()) {
                let doc = parse(&text);
                let again = parse(&doc.to_text());
                prop_assert_eq!(again, doc);
            }
        }
    }
}

pub mod document {
    //! Lookups and structural edits over a [`Document`]'s section tree.
    //!
    //! Edits rewrite `Node::Section` handle lists; section bodies never move in the arena.
    //! Every edit either applies completely or returns a [`MoveError`] with the document
    //! untouched. Recorded indexes are not rewritten by edits; call
    //! [`Document::reindex`] to recompute them from current positions.

    use crate::core::*;
    use tracing::debug;

    fn rejected(err: &MoveError) {
        debug!(%err, "structural edit rejected");
    }

    impl Document {
        /// Depth-first search for the live section whose recorded index equals `index`.
        pub fn find_section(&self, index: &OrgIndex) -> Option<&Section> {
            self.find_section_id(index).map(|id| self.arena(id))
        }

        pub fn find_section_id(&self, index: &OrgIndex) -> Option<SectionId> {
            let mut stack: Vec<SectionId> =
                self.content.iter().rev().filter_map(Node::section_id).collect();
            while let Some(id) = stack.pop() {
                let section = self.arena(id);
                if section.index.as_ref() == Some(index) {
                    return Some(id);
                }
                stack.extend(section.content.iter().rev().filter_map(Node::section_id));
            }
            None
        }

        /// Walks `index` as content positions from the document root. Only sections have
        /// children; any other node or an out-of-range component ends the walk.
        pub fn node_at(&self, index: &OrgIndex) -> Option<&Node> {
            let (first, rest) = index.path().split_first()?;
            let mut node = self.content.get(*first)?;
            for at in rest {
                let Node::Section(id) = node else {
                    return None;
                };
                node = self.arena(*id).content.get(*at)?;
            }
            Some(node)
        }

        pub fn section_at(&self, index: &OrgIndex) -> Option<&Section> {
            self.node_at(index)
                .and_then(Node::section_id)
                .map(|id| self.arena(id))
        }

        /// Moves the node at `content_index` of section `from` to the end of section `to`.
        /// A moved section must be strictly deeper than its new parent.
        pub fn move_content(
            &mut self,
            from: &OrgIndex,
            to: &OrgIndex,
            content_index: usize,
        ) -> Result<(), MoveError> {
            self.try_move_content(from, to, content_index)
                .inspect_err(rejected)
        }

        fn try_move_content(
            &mut self,
            from: &OrgIndex,
            to: &OrgIndex,
            content_index: usize,
        ) -> Result<(), MoveError> {
            let source = self
                .find_section_id(from)
                .ok_or_else(|| MoveError::SectionNotFound(from.clone()))?;
            let target = self
                .find_section_id(to)
                .ok_or_else(|| MoveError::SectionNotFound(to.clone()))?;

            let len = self.arena(source).content.len();
            let node = self
                .arena(source)
                .content
                .get(content_index)
                .ok_or(MoveError::ContentOutOfRange {
                    index: content_index,
                    len,
                })?;
            if let Some(moved) = node.section_id() {
                self.check_depth(moved, target)?;
            }

            let node = self.arena_mut(source).content.remove(content_index);
            debug!(%from, %to, content_index, kind = node.kind_name(), "moved content");
            self.attach(target, node);
            Ok(())
        }

        /// Moves a direct subsection between two top-level sections addressed by their
        /// positions in the document's top-level content.
        pub fn move_subsection(
            &mut self,
            from_top: usize,
            subsection_index: usize,
            to_top: usize,
        ) -> Result<(), MoveError> {
            self.try_move_subsection(from_top, subsection_index, to_top)
                .inspect_err(rejected)
        }

        fn try_move_subsection(
            &mut self,
            from_top: usize,
            subsection_index: usize,
            to_top: usize,
        ) -> Result<(), MoveError> {
            let source = self.top_level_id(from_top)?;
            let target = self.top_level_id(to_top)?;

            let parent = self.arena(source);
            let moved = parent
                .content
                .get(subsection_index)
                .ok_or(MoveError::ContentOutOfRange {
                    index: subsection_index,
                    len: parent.content.len(),
                })?
                .section_id()
                .ok_or(MoveError::NotASection(subsection_index))?;
            let level = self.arena(moved).level;
            if level != parent.level + 1 {
                return Err(MoveError::LevelMismatch {
                    moved: level,
                    parent: parent.level,
                });
            }
            self.check_depth(moved, target)?;

            let node = self.arena_mut(source).content.remove(subsection_index);
            debug!(from_top, subsection_index, to_top, "moved subsection");
            self.attach(target, node);
            Ok(())
        }

        /// Like [`Document::move_subsection`], locating the subsection by exact title.
        pub fn move_subsection_titled(
            &mut self,
            title: &str,
            from_top: usize,
            to_top: usize,
        ) -> Result<(), MoveError> {
            let found = self.top_level_id(from_top).and_then(|source| {
                let parent = self.arena(source);
                parent
                    .content
                    .iter()
                    .position(|node| {
                        node.section_id().map(|id| self.arena(id)).is_some_and(|child| {
                            child.level == parent.level + 1
                                && child.title.as_deref() == Some(title)
                        })
                    })
                    .ok_or_else(|| MoveError::SubsectionNotFound(title.to_string()))
            });
            match found {
                Ok(at) => self.move_subsection(from_top, at, to_top),
                Err(err) => {
                    rejected(&err);
                    Err(err)
                }
            }
        }

        /// Level-1 sections of the top-level content.
        pub fn top_level_sections(&self) -> Vec<&Section> {
            self.content
                .iter()
                .filter_map(Node::section_id)
                .map(|id| self.arena(id))
                .filter(|section| section.level == 1)
                .collect()
        }

        /// Direct subsections (one level deeper) of the section at top-level position
        /// `top`; empty when that position is not a section.
        pub fn subsections(&self, top: usize) -> Vec<&Section> {
            let Ok(id) = self.top_level_id(top) else {
                return vec![];
            };
            let level = self.arena(id).level;
            self.child_sections(id)
                .into_iter()
                .map(|child| self.arena(child))
                .filter(|child| child.level == level + 1)
                .collect()
        }

        /// Handles of the sections directly under `parent`, in order.
        pub fn child_sections(&self, parent: SectionId) -> Vec<SectionId> {
            self.section(parent)
                .map(|section| section.child_section_ids().collect())
                .unwrap_or_default()
        }

        pub fn find_subsection(&self, parent: SectionId, title: &str) -> Option<SectionId> {
            self.child_sections(parent)
                .into_iter()
                .find(|id| self.arena(*id).title.as_deref() == Some(title))
        }

        /// Unlinks the first direct subsection titled `title`. The section stays in the
        /// arena and can be attached elsewhere with [`Document::add_subsection`].
        pub fn detach_subsection(
            &mut self,
            parent: SectionId,
            title: &str,
        ) -> Result<SectionId, MoveError> {
            let Some(child) = self.find_subsection(parent, title) else {
                let err = MoveError::SubsectionNotFound(title.to_string());
                rejected(&err);
                return Err(err);
            };
            self.arena_mut(parent)
                .content
                .retain(|node| node.section_id() != Some(child));
            debug!(?parent, ?child, title, "detached subsection");
            Ok(child)
        }

        /// Appends a detached section under `parent`.
        pub fn add_subsection(&mut self, parent: SectionId, child: SectionId) -> Result<(), MoveError> {
            let result = if let Some(unknown) = [parent, child]
                .into_iter()
                .find(|id| self.section(*id).is_none())
            {
                Err(MoveError::UnknownSection(unknown))
            } else if self.is_attached(child) {
                Err(MoveError::AlreadyAttached(child))
            } else {
                self.check_depth(child, parent)
            };
            result.inspect_err(rejected)?;
            self.attach(parent, Node::Section(child));
            Ok(())
        }

        /// Whether `id` is reachable from the document root.
        pub fn is_attached(&self, id: SectionId) -> bool {
            let mut stack: Vec<SectionId> =
                self.content.iter().filter_map(Node::section_id).collect();
            while let Some(next) = stack.pop() {
                if next == id {
                    return true;
                }
                stack.extend(self.arena(next).child_section_ids());
            }
            false
        }

        /// Recomputes every attached section's index from its current position, deriving
        /// each one from [`OrgIndex::root`] with `next` and `descend`.
        pub fn reindex(&mut self) {
            let mut pending = positioned_sections(&self.content, OrgIndex::root());
            while let Some((id, index)) = pending.pop() {
                let children = positioned_sections(&self.arena(id).content, index.descend());
                self.arena_mut(id).index = Some(index);
                pending.extend(children);
            }
        }

        fn top_level_id(&self, top: usize) -> Result<SectionId, MoveError> {
            self.content
                .get(top)
                .ok_or(MoveError::TopLevelOutOfRange {
                    index: top,
                    len: self.content.len(),
                })?
                .section_id()
                .ok_or(MoveError::NotASection(top))
        }

        fn check_depth(&self, moved: SectionId, parent: SectionId) -> Result<(), MoveError> {
            let moved = self.arena(moved).level;
            let parent = self.arena(parent).level;
            if moved > parent {
                Ok(())
            } else {
                Err(MoveError::LevelMismatch { moved, parent })
            }
        }

        fn attach(&mut self, parent: SectionId, node: Node) {
            self.arena_mut(parent).content.push(node);
        }
    }

    fn positioned_sections(content: &[Node], first: OrgIndex) -> Vec<(SectionId, OrgIndex)> {
        let mut index = first;
        let mut out = vec![];
        for node in content {
            if let Some(id) = node.section_id() {
                out.push((id, index.clone()));
            }
            index = index.next();
        }
        out
    }

}

pub mod format {
    //! Document -> Org text.
    //!
    //! Output is canonical rather than byte-identical: settings come first, lists are
    //! re-indented two spaces per level, tables are re-aligned and day names are derived
    //! from dates. Parsing the output yields the same tree for well-formed input.

    use crate::core::*;

    pub fn format_document(doc: &Document) -> String {
        let mut out = String::new();
        for (key, value) in &doc.settings {
            out.push_str(&render_setting(key, value));
        }
        render_content(&mut out, doc, &doc.content);
        out
    }

    fn render_setting(key: &str, value: &str) -> String {
        if value.is_empty() {
            format!("#+{key}:\n")
        } else {
            format!("#+{key}: {value}\n")
        }
    }

    /// Renders sibling nodes. A greedy construct followed by another non-section sibling
    /// gets a blank line so the two do not merge when read back.
    fn render_content(out: &mut String, doc: &Document, nodes: &[Node]) {
        for (i, node) in nodes.iter().enumerate() {
            render_node(out, doc, node);
            let greedy = matches!(
                node,
                Node::Paragraph(_) | Node::List(_) | Node::Table(_) | Node::Footnote(_)
            );
            let next_is_body = nodes
                .get(i + 1)
                .is_some_and(|next| next.section_id().is_none());
            if greedy && next_is_body {
                out.push('\n');
            }
        }
    }

    fn render_node(out: &mut String, doc: &Document, node: &Node) {
        match node {
            Node::Section(id) => {
                if let Some(section) = doc.section(*id) {
                    out.push_str(&render_headline(section));
                    render_content(out, doc, &section.content);
                }
            }
            Node::Paragraph(paragraph) => {
                for line in &paragraph.lines {
                    push_body_line(out, line);
                }
            }
            Node::List(list) => out.push_str(&render_list(doc, list, 0)),
            Node::Table(table) => out.push_str(&render_table(table)),
            Node::Drawer(drawer) => out.push_str(&render_drawer(drawer)),
            Node::Planning(planning) => out.push_str(&render_planning(planning)),
            Node::Footnote(footnote) => out.push_str(&render_footnote(footnote)),
            Node::Block(block) => out.push_str(&render_block(block)),
            Node::Comment(text) => {
                out.push('#');
                if !text.is_empty() {
                    out.push(' ');
                    out.push_str(text);
                }
                out.push('\n');
            }
            Node::HorizontalRule => out.push_str("-----\n"),
        }
    }

    /// Writes one line of body text. Text starting with stars and a space was indented
    /// in the source and keeps one space so it does not read back as a headline.
    fn push_body_line(out: &mut String, line: &str) {
        let starred = line.starts_with('*')
            && line
                .trim_start_matches('*')
                .starts_with(char::is_whitespace);
        if starred {
            out.push(' ');
        }
        out.push_str(line);
        out.push('\n');
    }

    pub fn render_headline(section: &Section) -> String {
        let mut buf = "*".repeat(section.level.max(1));

        if let Some(keyword) = &section.keyword {
            buf.push(' ');
            buf.push_str(keyword);
        }

        if let Some(priority) = &section.priority {
            buf.push_str(&format!(" [#{}]", priority.0));
        }

        if let Some(title) = &section.title {
            buf.push(' ');
            buf.push_str(title);
        }

        if !section.tags.is_empty() {
            buf.push_str(" :");
            for tag in &section.tags {
                buf.push_str(tag);
                buf.push(':');
            }
        }

        // a bare `*` is not a headline
        if !buf.contains(' ') {
            buf.push(' ');
        }
        buf.push('\n');
        buf
    }

    fn render_list(doc: &Document, list: &List, depth: usize) -> String {
        let mut indent = "  ".repeat(depth);
        // a `*` bullet at column 0 would read back as a headline
        if depth == 0 && list.items.iter().any(|item| item.marker == "*") {
            indent.push(' ');
        }
        let mut buf = String::new();
        for item in &list.items {
            buf.push_str(&indent);
            buf.push_str(&item.marker);
            buf.push(' ');

            let mut rest = item.content.as_slice();
            let first_line = match item.content.first() {
                Some(Node::Paragraph(paragraph)) => {
                    rest = &item.content[1..];
                    paragraph.lines.split_first()
                }
                _ => None,
            };

            if let Some(cb) = item.checkbox {
                buf.push('[');
                buf.push(cb.mark());
                buf.push(']');
                if first_line.is_some() {
                    buf.push(' ');
                }
            }

            let continuation = format!("{indent}  ");
            match first_line {
                Some((line, more)) => {
                    buf.push_str(line);
                    buf.push('\n');
                    for line in more {
                        buf.push_str(&continuation);
                        buf.push_str(line);
                        buf.push('\n');
                    }
                }
                None => buf.push('\n'),
            }

            for node in rest {
                match node {
                    Node::List(nested) => buf.push_str(&render_list(doc, nested, depth + 1)),
                    Node::Paragraph(paragraph) => {
                        for line in &paragraph.lines {
                            buf.push_str(&continuation);
                            buf.push_str(line);
                            buf.push('\n');
                        }
                    }
                    other => {
                        let mut nested = String::new();
                        render_node(&mut nested, doc, other);
                        for line in nested.lines() {
                            buf.push_str(&continuation);
                            buf.push_str(line);
                            buf.push('\n');
                        }
                    }
                }
            }
        }
        buf
    }

    /// Rows padded to per-column widths; rules follow the widths.
    fn render_table(table: &Table) -> String {
        let mut widths = vec![1; table.column_count()];
        for row in &table.rows {
            if let TableRow::Cells(cells) = row {
                for (col, cell) in cells.iter().enumerate() {
                    widths[col] = widths[col].max(cell.chars().count());
                }
            }
        }

        let mut buf = String::new();
        for row in &table.rows {
            match row {
                TableRow::Cells(cells) => {
                    let padded: Vec<String> = cells
                        .iter()
                        .zip(&widths)
                        .map(|(cell, &width)| format!("{cell:<width$}"))
                        .collect();
                    buf.push_str("| ");
                    buf.push_str(&padded.join(" | "));
                    buf.push_str(" |\n");
                }
                TableRow::Rule => {
                    let segments: Vec<String> =
                        widths.iter().map(|w| "-".repeat(w + 2)).collect();
                    buf.push('|');
                    if segments.is_empty() {
                        buf.push_str("---");
                    } else {
                        buf.push_str(&segments.join("+"));
                    }
                    buf.push_str("|\n");
                }
            }
        }
        buf
    }

    fn render_drawer(drawer: &Drawer) -> String {
        let mut buf = String::new();
        buf.push(':');
        buf.push_str(&drawer.name);
        buf.push_str(":\n");
        for line in &drawer.lines {
            match line {
                DrawerLine::Property { key, value } if value.is_empty() => {
                    buf.push_str(&format!(":{key}:\n"));
                }
                DrawerLine::Property { key, value } => {
                    buf.push_str(&format!(":{key}: {value}\n"));
                }
                DrawerLine::Raw(raw) => push_body_line(&mut buf, raw),
            }
        }
        buf.push_str(":END:\n");
        buf
    }

    fn render_planning(planning: &Planning) -> String {
        match &planning.timestamp {
            Some(ts) => format!("{}: {}\n", planning.keyword.as_str(), render_timestamp(ts)),
            None => format!("{}:\n", planning.keyword.as_str()),
        }
    }

    fn render_footnote(footnote: &Footnote) -> String {
        let mut buf = format!("[fn:{}]", footnote.label);
        let mut rest = footnote.content.as_slice();
        let mut first_lines: &[String] = &[];
        if let Some(Node::Paragraph(paragraph)) = footnote.content.first() {
            rest = &footnote.content[1..];
            first_lines = &paragraph.lines;
        }
        match first_lines.split_first() {
            Some((first, more)) => {
                buf.push(' ');
                buf.push_str(first);
                buf.push('\n');
                for line in more {
                    push_body_line(&mut buf, line);
                }
            }
            None => buf.push('\n'),
        }
        for node in rest {
            if let Node::Paragraph(paragraph) = node {
                for line in &paragraph.lines {
                    push_body_line(&mut buf, line);
                }
            }
        }
        buf
    }

    fn render_block(block: &Block) -> String {
        let mut buf = String::new();
        buf.push_str("#+BEGIN_");
        buf.push_str(&block.kind);
        if let Some(params) = &block.params {
            buf.push(' ');
            buf.push_str(params);
        }
        buf.push('\n');
        for line in &block.lines {
            buf.push_str(line);
            buf.push('\n');
        }
        buf.push_str("#+END_");
        buf.push_str(&block.kind);
        buf.push('\n');
        buf
    }

    pub fn render_timestamp(ts: &Timestamp) -> String {
        let mut buf = String::new();
        buf.push(if ts.active { '<' } else { '[' });
        buf.push_str(&ts.date.format("%Y-%m-%d %a").to_string());
        if let Some(time) = ts.time {
            buf.push(' ');
            buf.push_str(&time.format("%H:%M").to_string());
            if let Some(end) = ts.end_time {
                buf.push('-');
                buf.push_str(&end.format("%H:%M").to_string());
            }
        }
        if let Some(Repeater { kind, interval }) = &ts.repeater {
            buf.push(' ');
            buf.push_str(kind.as_str());
            buf.push_str(&render_interval(interval));
        }
        if let Some(delay) = &ts.delay {
            buf.push_str(" -");
            buf.push_str(&render_interval(delay));
        }
        buf.push(if ts.active { '>' } else { ']' });
        buf
    }

    fn render_interval(interval: &Interval) -> String {
        format!("{}{}", interval.value, interval.unit.as_char())
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::OrgParser;
        use chrono::{NaiveDate, NaiveTime};

        fn parse(text: &str) -> Document {
            OrgParser::default().parse(text)
        }

        fn round_trip(text: &str) {
            let doc = parse(text);
            let rendered = format_document(&doc);
            assert_eq!(parse(&rendered), doc, "rendered:\n{rendered}");
        }

        #[test]
        fn renders_readme() {
            let content = r#"#+TITLE: SwiftOrg

* org-mode Parser for Swift

  [[https://img.shields.io/github/license/mashape/apistatus.svg?maxAge=2592000]]

  [[http://orgmode.org/][org-mode]] is awesome. This is the first step to bring it to iOS, (arguably) the
  most popular platform on the planet.

* Usage
  An simple example will explain everything.

  #+BEGIN_SRC swift
    import SwiftOrg

    let parser = OrgParser()
  #+END_SRC
"#;
            let doc = parse(content);
            let text = doc.to_text();
            assert!(text.contains("#+TITLE: SwiftOrg"));
            assert!(text.contains("* org-mode Parser for Swift"));
            assert!(text.contains("* Usage"));
            assert!(text.contains("#+BEGIN_SRC swift\n    import SwiftOrg\n\n    let parser = OrgParser()\n#+END_SRC\n"));
            assert_eq!(parse(&text), doc);
        }

        #[test]
        fn headline_parts_in_order() {
            let doc = parse("* TODO [#b] Fix bug   :work:urgent:\n** \n");
            assert_eq!(doc.to_text(), "* TODO [#B] Fix bug :work:urgent:\n** \n");
        }

        #[test]
        fn blank_line_only_between_mergeable_siblings() {
            let doc = parse("* A\none\n\ntwo\n** B\n| x |\n\n| y |\n# c\n");
            assert_eq!(
                doc.to_text(),
                "* A\none\n\ntwo\n** B\n| x |\n\n| y |\n\n# c\n"
            );
        }

        #[test]
        fn lists_are_reindented() {
            let doc = parse("-   [x] done\n    more\n    1) inner\n+ [ ]\n");
            assert_eq!(
                doc.to_text(),
                "- [X] done\n  more\n  1) inner\n+ [ ]\n"
            );
            round_trip("- a\n  - b\n    - c\n  tail of a\n- d\n");
        }

        #[test]
        fn tables_are_aligned() {
            let doc = parse("|a|bbb|\n|-\n|cc|d|\n");
            assert_eq!(doc.to_text(), "| a  | bbb |\n|----+-----|\n| cc | d   |\n");
        }

        #[test]
        fn drawers_planning_blocks_and_footnotes() {
            let text = "* H\nSCHEDULED: <2024-05-01 Wed 10:00-11:30 +1w -2d>\nCLOSED:\n:PROPERTIES:\n:ID:   x1\n:FLAG:\n:END:\n#+begin_example\n  raw *text*\n#+end_example\n[fn:a] first\nsecond\n-----\n";
            let doc = parse(text);
            assert_eq!(
                doc.to_text(),
                "* H\nSCHEDULED: <2024-05-01 Wed 10:00-11:30 +1w -2d>\nCLOSED:\n:PROPERTIES:\n:ID: x1\n:FLAG:\n:END:\n#+BEGIN_EXAMPLE\n  raw *text*\n#+END_EXAMPLE\n[fn:a] first\nsecond\n\n-----\n"
            );
            round_trip(text);
        }

        #[test]
        fn timestamp_day_name_comes_from_date() {
            let ts = Timestamp {
                active: false,
                date: NaiveDate::from_ymd_opt(2024, 1, 1).expect("date"),
                time: NaiveTime::from_hms_opt(9, 5, 0),
                end_time: None,
                repeater: Some(Repeater {
                    kind: RepeaterKind::FromBase,
                    interval: Interval {
                        value: 2,
                        unit: IntervalUnit::Month,
                    },
                }),
                delay: None,
            };
            assert_eq!(render_timestamp(&ts), "[2024-01-01 Mon 09:05 ++2m]");

            let doc = parse("DEADLINE: <2024-01-01 Fri>\n");
            assert_eq!(doc.to_text(), "DEADLINE: <2024-01-01 Mon>\n");
        }

        #[test]
        fn settings_render_first() {
            let doc = parse("* A\n#+STARTUP: overview\n#+TITLE: T\n");
            assert_eq!(doc.to_text(), "#+STARTUP: overview\n#+TITLE: T\n* A\n");
        }

        #[test]
        fn degraded_input_round_trips() {
            round_trip(":LOGBOOK:\n- unterminated\n* next\n#+BEGIN_SRC\nnever closed\n");
            round_trip(":END:\n#+END_QUOTE\n");
        }
    }
}

pub mod export {
    //! Tree -> JSON, a direct structural mapping. Every node carries a `type` tag.

    use crate::core::*;
    use crate::format::render_timestamp;
    use serde_json::{Value, json};

    pub fn document_to_json(doc: &Document) -> Value {
        json!({
            "title": doc.title(),
            "settings": doc.settings,
            "todos": doc.todos(),
            "content": project_nodes(doc, &doc.content),
        })
    }

    fn project_nodes(doc: &Document, nodes: &[Node]) -> Vec<Value> {
        nodes.iter().map(|node| project_node(doc, node)).collect()
    }

    fn project_node(doc: &Document, node: &Node) -> Value {
        let kind = node.kind_name();
        match node {
            Node::Section(id) => match doc.section(*id) {
                Some(section) => json!({
                    "type": kind,
                    "index": section.index.as_ref().map(ToString::to_string),
                    "level": section.level,
                    "keyword": section.keyword,
                    "done": section
                        .keyword
                        .as_deref()
                        .is_some_and(|k| doc.is_done_keyword(k)),
                    "priority": section.priority,
                    "title": section.title,
                    "tags": section.tags,
                    "content": project_nodes(doc, &section.content),
                }),
                None => Value::Null,
            },
            Node::Paragraph(paragraph) => json!({ "type": kind, "lines": paragraph.lines }),
            Node::List(list) => {
                let items: Vec<Value> = list
                    .items
                    .iter()
                    .map(|item| {
                        json!({
                            "marker": item.marker,
                            "checkbox": item.checkbox,
                            "content": project_nodes(doc, &item.content),
                        })
                    })
                    .collect();
                json!({ "type": kind, "ordered": list.is_ordered(), "items": items })
            }
            Node::Table(table) => json!({ "type": kind, "rows": table.rows }),
            Node::Drawer(drawer) => json!({
                "type": kind,
                "name": drawer.name,
                "lines": drawer.lines,
            }),
            Node::Planning(planning) => json!({
                "type": kind,
                "keyword": planning.keyword,
                "timestamp": planning.timestamp,
                "text": planning.timestamp.as_ref().map(render_timestamp),
            }),
            Node::Footnote(footnote) => json!({
                "type": kind,
                "label": footnote.label,
                "content": project_nodes(doc, &footnote.content),
            }),
            Node::Block(block) => json!({
                "type": kind,
                "kind": block.kind,
                "params": block.params,
                "lines": block.lines,
            }),
            Node::Comment(text) => json!({ "type": kind, "text": text }),
            Node::HorizontalRule => json!({ "type": kind }),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::parser::OrgParser;

        #[test]
        fn sections_and_body_nodes() {
            let doc = OrgParser::default().parse(
                "#+TITLE: Plan\n* DONE [#C] Ship :rel:\nCLOSED: [2024-02-02 Fri]\n- [X] tag\n** Notes\n| a |\n",
            );
            let value = document_to_json(&doc);
            assert_eq!(value["title"], "Plan");
            assert_eq!(value["todos"], json!([["TODO"], ["DONE"]]));

            let ship = &value["content"][0];
            assert_eq!(ship["type"], "section");
            assert_eq!(ship["index"], "0");
            assert_eq!(ship["keyword"], "DONE");
            assert_eq!(ship["done"], true);
            assert_eq!(ship["priority"], "C");
            assert_eq!(ship["tags"], json!(["rel"]));

            let planning = &ship["content"][0];
            assert_eq!(planning["keyword"], "CLOSED");
            assert_eq!(planning["text"], "[2024-02-02 Fri]");
            assert_eq!(planning["timestamp"]["active"], false);

            let list = &ship["content"][1];
            assert_eq!(list["type"], "list");
            assert_eq!(list["ordered"], false);
            assert_eq!(list["items"][0]["checkbox"], "Checked");

            let notes = &ship["content"][2];
            assert_eq!(notes["index"], "0.2");
            assert_eq!(notes["content"][0]["rows"], json!([{ "cells": ["a"] }]));
        }

        #[test]
        fn empty_document() {
            let value = document_to_json(&OrgParser::default().parse(""));
            assert_eq!(value["content"], json!([]));
            assert!(value["title"].is_null());
        }
    }
}

pub mod storage {
    //! File loading and saving glue.

    use crate::core::Document;
    use crate::format::format_document;
    use crate::parser::OrgParser;
    use anyhow::{Context, Result};
    use std::{fs, path::Path};

    /// Parsing is independent of where the text comes from.
    pub trait DocumentLoader {
        fn load_file(&self, path: &Path) -> Result<Document>;
    }

    impl DocumentLoader for OrgParser {
        fn load_file(&self, path: &Path) -> Result<Document> {
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
            Ok(self.parse(&text))
        }
    }

    /// Writes the canonical rendering of `doc` to `path`.
    pub fn save_file(doc: &Document, path: &Path) -> Result<()> {
        fs::write(path, format_document(doc)).with_context(|| format!("writing {:?}", path))
    }

}

pub use crate::core::{Document, MoveError, Node, OrgIndex, Section, SectionId};
pub use crate::format::format_document;
pub use crate::parser::OrgParser;
pub use crate::storage::DocumentLoader;
