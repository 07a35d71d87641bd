//! Terminal stand-in for a chat service
//!
//! A terminal cannot edit what it already printed, so edits print only the
//! lines that changed since the last version of the message.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use console::style;
use taskbridge_core::render::markup;
use taskbridge_core::{ChatTransport, InteractionPrompt, InteractionRequest, MessageHandle, OutboundText, TextFormat};
use taskbridge_core::{TransportError, UserId};

pub struct ConsoleTransport {
    next_id: AtomicI64,
    /// Lines already printed per message, status line excluded
    printed: Mutex<HashMap<i64, Vec<String>>>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            printed: Mutex::new(HashMap::new()),
        }
    }

    fn print_update(&self, message_id: i64, text: &OutboundText) {
        let plain = match text.format {
            TextFormat::Html => html_to_terminal(&text.body),
            TextFormat::Plain => text.body.clone(),
        };
        let lines: Vec<String> = plain.lines().map(str::to_string).collect();

        let mut printed = match self.printed.lock() {
            Ok(printed) => printed,
            Err(poisoned) => poisoned.into_inner(),
        };
        let seen = printed.entry(message_id).or_default();
        let common = seen.iter().zip(&lines).take_while(|(a, b)| a == b).count();

        let mut kept = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            let is_status = line.starts_with('⏳');
            if idx >= common {
                if is_status {
                    println!("{}", style(line).dim());
                } else {
                    println!("{}", line);
                }
            }
            if !is_status {
                kept.push(line.clone());
            }
        }
        *seen = kept;
    }
}

#[async_trait]
impl ChatTransport for ConsoleTransport {
    async fn send(&self, user_id: UserId, text: &OutboundText) -> Result<MessageHandle, TransportError> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.print_update(message_id, text);
        Ok(MessageHandle::new(user_id, message_id))
    }

    async fn edit(&self, handle: &MessageHandle, text: &OutboundText) -> Result<(), TransportError> {
        self.print_update(handle.message_id, text);
        Ok(())
    }

    async fn delete(&self, handle: &MessageHandle) -> Result<(), TransportError> {
        if let Ok(mut printed) = self.printed.lock() {
            printed.remove(&handle.message_id);
        }
        Ok(())
    }

    async fn present_interaction(
        &self,
        user_id: UserId,
        request: &InteractionRequest,
    ) -> Result<MessageHandle, TransportError> {
        let message_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        println!();
        println!("{}", html_to_terminal(&markup::describe_interaction(request)));
        let hint = match &request.prompt {
            InteractionPrompt::Permission { .. } => "/approve [note]  or  /deny [note]",
            InteractionPrompt::Question { .. } => "/answer <text>",
            InteractionPrompt::Plan { .. } => "/plan approve  or  /plan reject [feedback]",
        };
        println!("{}", style(hint).cyan());
        Ok(MessageHandle::new(user_id, message_id))
    }
}

/// Render the renderer's HTML subset with terminal styling
pub fn html_to_terminal(html: &str) -> String {
    let mut out = String::new();
    let mut segment = String::new();
    let mut bold = 0usize;
    let mut italic = 0usize;
    let mut code = 0usize;

    let mut chars = html.chars();
    while let Some(c) = chars.next() {
        if c != '<' {
            segment.push(c);
            continue;
        }
        let tag: String = chars.by_ref().take_while(|&c| c != '>').collect();
        flush_segment(&mut out, &mut segment, bold > 0, italic > 0, code > 0);

        let (closing, name) = match tag.strip_prefix('/') {
            Some(name) => (true, name),
            None => (false, tag.as_str()),
        };
        let counter = match name.split_whitespace().next().unwrap_or("") {
            "b" | "strong" => &mut bold,
            "i" | "em" => &mut italic,
            "code" | "pre" => &mut code,
            _ => continue,
        };
        if closing {
            *counter = counter.saturating_sub(1);
        } else {
            *counter += 1;
        }
    }
    flush_segment(&mut out, &mut segment, bold > 0, italic > 0, code > 0);
    out
}

fn flush_segment(out: &mut String, segment: &mut String, bold: bool, italic: bool, code: bool) {
    if segment.is_empty() {
        return;
    }
    let text = unescape(segment);
    segment.clear();

    let mut styled = style(text);
    if bold {
        styled = styled.bold();
    }
    if italic {
        styled = styled.italic();
    }
    if code {
        styled = styled.yellow();
    }
    out.push_str(&styled.to_string());
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_html_to_terminal_strips_tags() {
        console::set_colors_enabled(false);
        assert_eq!(
            html_to_terminal("<b>ls</b> <code>a &amp;&amp; b</code>\n<i>⏳ Working…</i>"),
            "ls a && b\n⏳ Working…"
        );
    }
}
