//! Streaming markdown → chat HTML converter
//!
//! Parsing is done by `pulldown-cmark`; this module only maps its events
//! onto the small tag set chat services accept (`b`, `i`, `s`, `code`,
//! `pre`, `blockquote`). Lists, rules and links become plain text.
//!
//! Output is split into message parts, so a part may start in the middle
//! of a construct (most often a fenced code block). The [`Carry`] left by
//! one part holds the source of the block still open at its end. The next
//! part is parsed with that source in front of it as hidden context: the
//! context itself produces no output, but elements running across the
//! boundary re-open their tags before the first visible content.
//!
//! Because the parser balances every Start with an End, each rendered part
//! is well-formed on its own.

use std::ops::Range;

use pulldown_cmark::{Event, LinkType, Options, Parser, Tag};

use crate::interaction::{InteractionPrompt, InteractionRequest};

/// Appended after a chunk to find out which elements would continue into more text
const SENTINEL: char = 'x';

/// Output flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Chat HTML subset, text escaped
    Html,
    /// Markers removed, no tags, no escaping
    Plain,
}

/// A markup construct that can be open across a chunk boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Span {
    Bold,
    Italic,
    Strike,
    Code,
    Pre,
    Quote,
    Heading,
}

impl Span {
    fn tag(self) -> &'static str {
        match self {
            Span::Bold | Span::Heading => "b",
            Span::Italic => "i",
            Span::Strike => "s",
            Span::Code => "code",
            Span::Pre => "pre",
            Span::Quote => "blockquote",
        }
    }

    fn of(tag: &Tag<'_>) -> Option<Span> {
        match tag {
            Tag::Strong => Some(Span::Bold),
            Tag::Emphasis => Some(Span::Italic),
            Tag::Strikethrough => Some(Span::Strike),
            Tag::CodeBlock(_) => Some(Span::Pre),
            Tag::BlockQuote(_) => Some(Span::Quote),
            Tag::Heading { .. } => Some(Span::Heading),
            _ => None,
        }
    }
}

/// Parser state carried from one chunk into the next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Carry {
    open: Vec<Span>,
    /// Source of the block still open at the end of the chunk
    context: String,
}

impl Carry {
    /// Spans open at the end of the chunk, outermost first
    pub fn open_spans(&self) -> &[Span] {
        &self.open
    }

    pub fn is_clean(&self) -> bool {
        self.open.is_empty() && self.context.is_empty()
    }
}

/// Result of rendering one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub text: String,
    pub carry: Carry,
}

impl Rendered {
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

fn options() -> Options {
    Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS
}

/// Render a chunk of markdown, starting from the state left by the previous chunk
pub fn render(flavor: Flavor, carry: &Carry, source: &str) -> Rendered {
    Rendered {
        text: render_text(flavor, carry, source),
        carry: carry_after(carry, source),
    }
}

/// Rendered text of a chunk, without working out its carry
pub fn render_text(flavor: Flavor, carry: &Carry, source: &str) -> String {
    let mut doc = String::with_capacity(carry.context.len() + source.len());
    doc.push_str(&carry.context);
    doc.push_str(source);

    let mut writer = Writer::new(flavor, carry.context.len());
    for (event, range) in Parser::new_ext(&doc, options()).into_offset_iter() {
        writer.event(event, range, &doc);
    }
    writer.finish()
}

/// State to resume from after `source` has been rendered on top of `carry`
pub fn carry_after(carry: &Carry, source: &str) -> Carry {
    let mut doc = String::with_capacity(carry.context.len() + source.len() + 1);
    doc.push_str(&carry.context);
    doc.push_str(source);
    let end = doc.len();
    doc.push(SENTINEL);

    // Elements that would swallow more text, outermost first
    let mut running: Vec<(usize, Option<Span>)> = Vec::new();
    for (event, range) in Parser::new_ext(&doc, options()).into_offset_iter() {
        if let Event::Start(tag) = event
            && range.start < end
            && range.end > end
        {
            running.push((range.start, Span::of(&tag)));
        }
    }

    let open: Vec<Span> = running.iter().filter_map(|(_, span)| *span).collect();
    let context = match running.first() {
        Some((start, _)) => {
            let block = &doc[*start..end];
            // A plain paragraph renders the same with or without what came before it
            if open.is_empty() && !block.contains(['*', '_', '~', '`']) {
                String::new()
            } else {
                block.to_string()
            }
        }
        None => String::new(),
    };
    Carry { open, context }
}

/// Render a complete document as chat HTML
pub fn to_html(source: &str) -> String {
    render_text(Flavor::Html, &Carry::default(), source)
}

/// Render a complete document as plain text
pub fn to_plain(source: &str) -> String {
    render_text(Flavor::Plain, &Carry::default(), source)
}

/// Escape text for the chat HTML subset
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    out
}

/// Backslash-escape characters markdown would treat as markup
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(
            c,
            '\\' | '*' | '_' | '~' | '`' | '>' | '<' | '#' | '-' | '+' | '.' | '!' | '[' | ']' | '(' | ')' | '|' | '&'
        ) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Truncate to at most `max` characters, marking the cut with an ellipsis
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Escape `text` for HTML, keeping the escaped form within `max` characters
///
/// The cut never lands inside an entity.
pub fn escape_html_truncated(text: &str, max: usize) -> String {
    let escaped = escape_html(text);
    if escaped.chars().count() <= max {
        return escaped;
    }
    let mut out = String::new();
    let mut used = 0;
    for c in text.chars() {
        let width = match c {
            '<' | '>' => 4,
            '&' => 5,
            _ => 1,
        };
        // One character stays free for the ellipsis
        if used + width + 1 > max {
            break;
        }
        used += width;
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    if max > 0 {
        out.push('…');
    }
    out
}

/// Chat HTML shown when a turn pauses for a decision
pub fn describe_interaction(request: &InteractionRequest) -> String {
    match &request.prompt {
        InteractionPrompt::Permission {
            tool_name,
            arguments,
        } => {
            let args = serde_json::to_string_pretty(arguments).unwrap_or_else(|_| arguments.to_string());
            format!(
                "🔐 <b>Permission required</b>\nTool: <code>{}</code>\n<pre>{}</pre>",
                escape_html(tool_name),
                escape_html(&truncate_chars(&args, 800))
            )
        }
        InteractionPrompt::Question { question, options } => {
            let mut out = format!("❓ <b>Question</b>\n{}", to_html(question));
            for option in options {
                out.push_str("\n• ");
                out.push_str(&escape_html(&option.label));
                if let Some(description) = &option.description {
                    out.push_str(" - <i>");
                    out.push_str(&escape_html(description));
                    out.push_str("</i>");
                }
            }
            out
        }
        InteractionPrompt::Plan { plan } => {
            format!("📋 <b>Plan approval</b>\n{}", to_html(&truncate_chars(plan, 3000)))
        }
    }
}

/// An element the parser has opened and not yet closed
#[derive(Debug, Default)]
struct Frame {
    span: Option<Span>,
    /// Its opening was written (or re-opened after the hidden context)
    shown: bool,
    /// Line breaks owed once the element closes
    gap_after: usize,
    list: Option<ListKind>,
    /// Destination written after a link's text
    link: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum ListKind {
    Bullet,
    Ordered(u64),
}

struct Writer {
    flavor: Flavor,
    out: String,
    frames: Vec<Frame>,
    /// Source before this offset is context only
    resume_at: usize,
    live: bool,
    /// Line breaks to write before the next visible output
    gap: usize,
}

impl Writer {
    fn new(flavor: Flavor, resume_at: usize) -> Self {
        Self {
            flavor,
            out: String::new(),
            frames: Vec::new(),
            resume_at,
            live: resume_at == 0,
            gap: 0,
        }
    }

    fn finish(self) -> String {
        self.out
    }

    fn in_item(&self) -> bool {
        self.frames.iter().any(|f| f.list.is_some())
    }

    fn event(&mut self, event: Event<'_>, range: Range<usize>, doc: &str) {
        match event {
            Event::Start(tag) => self.start(tag, range),
            Event::End(_) => self.end(),
            Event::Text(text) | Event::Html(text) | Event::InlineHtml(text) => {
                if let Some(visible) = self.visible_part(&text, &range, doc) {
                    self.write_text(&visible);
                }
            }
            Event::Code(code) => {
                if self.reaches(&range) {
                    self.open_tag(Span::Code);
                    self.write_text(&code);
                    self.close_tag(Span::Code);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if self.reaches(&range) {
                    self.out.push('\n');
                }
            }
            Event::Rule => {
                if self.reaches(&range) {
                    self.write_text("――――――――");
                    self.gap = 2;
                }
            }
            Event::TaskListMarker(checked) => {
                if self.reaches(&range) {
                    self.write_text(if checked { "☑ " } else { "☐ " });
                }
            }
            _ => {}
        }
    }

    /// Whether output for `range` is visible, going live the first time it is
    fn reaches(&mut self, range: &Range<usize>) -> bool {
        if !self.live {
            if range.end <= self.resume_at {
                return false;
            }
            self.go_live();
        }
        true
    }

    /// Re-open the tags of every element running across the boundary
    fn go_live(&mut self) {
        self.live = true;
        let pending: Vec<Span> = self.frames.iter().filter(|f| !f.shown).filter_map(|f| f.span).collect();
        for frame in &mut self.frames {
            frame.shown = true;
        }
        for span in pending {
            self.open_tag(span);
        }
    }

    /// The part of a text event past the hidden context
    fn visible_part(&mut self, text: &str, range: &Range<usize>, doc: &str) -> Option<String> {
        if !self.reaches(range) {
            return None;
        }
        if range.start >= self.resume_at {
            return Some(text.to_string());
        }
        let skip = self.resume_at - range.start;
        if text.len() == range.len() && text.is_char_boundary(skip) {
            Some(text[skip..].to_string())
        } else {
            doc.get(self.resume_at..range.end).map(str::to_string)
        }
    }

    fn start(&mut self, tag: Tag<'_>, range: Range<usize>) {
        if !self.live && range.start >= self.resume_at {
            self.go_live();
        }

        let block_gap = if self.in_item() { 1 } else { 2 };
        let mut frame = Frame {
            span: Span::of(&tag),
            ..Frame::default()
        };
        match &tag {
            Tag::Paragraph | Tag::CodeBlock(_) | Tag::HtmlBlock => frame.gap_after = block_gap,
            Tag::Heading { .. } | Tag::BlockQuote(_) => frame.gap_after = 2,
            Tag::List(first) => {
                frame.gap_after = block_gap;
                frame.list = Some(match first {
                    Some(n) => ListKind::Ordered(*n),
                    None => ListKind::Bullet,
                });
            }
            Tag::Item => frame.gap_after = 1,
            Tag::Link {
                link_type, dest_url, ..
            } if !matches!(link_type, LinkType::Autolink | LinkType::Email) => {
                frame.link = Some(dest_url.to_string());
            }
            _ => {}
        }

        // Ordinals advance even while hidden so numbering stays right
        let bullet = match tag {
            Tag::Item => Some(self.next_bullet()),
            _ => None,
        };

        if self.live {
            frame.shown = true;
            if let Some(bullet) = bullet {
                self.gap = self.gap.max(1);
                let depth = self.frames.iter().filter(|f| f.list.is_some()).count();
                let indent = "  ".repeat(depth.saturating_sub(1));
                self.write_text(&format!("{}{}", indent, bullet));
            }
            if let Some(span) = frame.span {
                self.open_tag(span);
            }
        }
        self.frames.push(frame);
    }

    fn next_bullet(&mut self) -> String {
        let Some(list) = self.frames.iter_mut().rev().find_map(|f| f.list.as_mut()) else {
            return "• ".to_string();
        };
        match list {
            ListKind::Bullet => "• ".to_string(),
            ListKind::Ordered(n) => {
                let bullet = format!("{}. ", n);
                *n += 1;
                bullet
            }
        }
    }

    fn end(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        if !frame.shown {
            return;
        }
        if let Some(url) = frame.link {
            self.write_text(&format!(" ({})", url));
        }
        if let Some(span) = frame.span {
            if span == Span::Pre && self.out.ends_with('\n') {
                self.out.pop();
            }
            self.close_tag(span);
        }
        self.gap = self.gap.max(frame.gap_after);
    }

    fn flush_gap(&mut self) {
        if !self.out.is_empty() {
            let have = self.out.len() - self.out.trim_end_matches('\n').len();
            for _ in have..self.gap {
                self.out.push('\n');
            }
        }
        self.gap = 0;
    }

    fn write_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.flush_gap();
        match self.flavor {
            Flavor::Html => self.out.push_str(&escape_html(text)),
            Flavor::Plain => self.out.push_str(text),
        }
    }

    fn open_tag(&mut self, span: Span) {
        self.flush_gap();
        if self.flavor == Flavor::Html {
            self.out.push('<');
            self.out.push_str(span.tag());
            self.out.push('>');
        }
    }

    fn close_tag(&mut self, span: Span) {
        if self.flavor == Flavor::Html {
            self.out.push_str("</");
            self.out.push_str(span.tag());
            self.out.push('>');
        }
    }
}
