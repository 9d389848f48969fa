use crate::conversation::{ContentBlock, Conversation, Message, Role, ToolInvocationRequest};
use crate::executor::ToolExecutor;
use crate::llm::InferenceGateway;
use color_eyre::eyre::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};
use log::{debug, warn};
use std::io::{self, BufRead, Write};

/// Pull-based source of user lines. `None` means the input is exhausted.
pub trait UserInput {
    fn read_line(&mut self) -> Option<String>;
}

/// Line reader over any buffered source; `stdin()` is the interactive one.
pub struct ReaderInput<R> {
    reader: R,
    prompt: bool,
}

impl ReaderInput<io::StdinLock<'static>> {
    pub fn stdin() -> Self {
        Self {
            reader: io::stdin().lock(),
            prompt: true,
        }
    }
}

impl<R: BufRead> ReaderInput<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            prompt: false,
        }
    }
}

impl<R: BufRead> UserInput for ReaderInput<R> {
    fn read_line(&mut self) -> Option<String> {
        if self.prompt {
            let mut stdout = io::stdout();
            execute!(
                stdout,
                SetForegroundColor(Color::Green),
                Print("You> "),
                ResetColor
            )
            .ok();
            stdout.flush().ok();
        }

        loop {
            let mut input = String::new();
            match self.reader.read_line(&mut input) {
                Ok(0) => return None,
                Ok(_) => return Some(input.trim_end_matches(&['\r', '\n'][..]).to_string()),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    warn!("Skipping input line that is not valid UTF-8: {}", e);
                    print_error("input line is not valid UTF-8, ignored");
                }
                Err(e) => {
                    warn!("Failed to read input, ending session: {}", e);
                    return None;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    WaitForUser,
    Infer,
    Dispatch,
    Done,
}

pub struct ChatSession<G, I> {
    gateway: G,
    executor: ToolExecutor,
    input: I,
    conversation: Conversation,
}

impl<G: InferenceGateway, I: UserInput> ChatSession<G, I> {
    pub fn new(gateway: G, executor: ToolExecutor, input: I) -> Self {
        Self {
            gateway,
            executor,
            input,
            conversation: Conversation::new(),
        }
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Runs until the input is exhausted or the user exits. A failed inference
    /// call ends the session with that error.
    pub async fn run(&mut self) -> Result<()> {
        let mut state = LoopState::WaitForUser;
        loop {
            debug!("state: {:?}", state);
            state = match state {
                LoopState::WaitForUser => self.wait_for_user(),
                LoopState::Infer => self.infer().await?,
                LoopState::Dispatch => self.dispatch(),
                LoopState::Done => return Ok(()),
            };
        }
    }

    fn wait_for_user(&mut self) -> LoopState {
        loop {
            let Some(input) = self.input.read_line() else {
                return LoopState::Done;
            };

            let command = input.trim();
            if command.is_empty() {
                continue;
            }

            match command {
                "/exit" | "/quit" => {
                    print_info("Goodbye!");
                    return LoopState::Done;
                }
                "/history" => self.show_history(),
                "/help" => self.show_help(),
                _ => {
                    self.conversation.push(Message::user_text(input.as_str()));
                    return LoopState::Infer;
                }
            }
        }
    }

    async fn infer(&mut self) -> Result<LoopState> {
        print_thinking();
        debug!("Sending {} messages", self.conversation.len());

        let response = self
            .gateway
            .send(self.conversation.messages(), self.executor.descriptors())
            .await?;

        for text in response.texts().filter(|text| !text.trim().is_empty()) {
            print_assistant(text);
        }

        let next = if response.has_tool_requests() {
            LoopState::Dispatch
        } else {
            LoopState::WaitForUser
        };
        self.conversation.push(response);
        Ok(next)
    }

    fn dispatch(&mut self) -> LoopState {
        let requests: Vec<ToolInvocationRequest> = self
            .conversation
            .last()
            .map(|message| message.tool_requests().cloned().collect())
            .unwrap_or_default();

        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            print_tool(&request.name, &request.raw_input.to_string());
            let result = self.executor.execute(request);
            print_result(&result.output, result.is_error);
            results.push(result);
        }

        self.conversation.push(Message::tool_results(results));
        LoopState::Infer
    }

    fn show_history(&self) {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Color::Cyan),
            Print("\n=== Conversation History ===\n\n"),
            ResetColor
        )
        .ok();

        if self.conversation.is_empty() {
            execute!(stdout, Print("(empty)\n\n")).ok();
        }

        for message in self.conversation.messages() {
            let (label, color) = match message.role {
                Role::User => ("user", Color::Green),
                Role::Model => ("model", Color::Blue),
            };
            for block in &message.content {
                let line = match block {
                    ContentBlock::Text(text) => text.clone(),
                    ContentBlock::ToolInvocationRequest(request) => {
                        format!("[call {}] {}({})", request.id, request.name, request.raw_input)
                    }
                    ContentBlock::ToolInvocationResult(result) => {
                        let status = if result.is_error { "error" } else { "ok" };
                        format!("[result {} {}] {}", result.id, status, preview(&result.output, 200))
                    }
                };
                execute!(
                    stdout,
                    SetForegroundColor(color),
                    Print(format!("{}: ", label)),
                    ResetColor,
                    Print(line),
                    Print("\n\n")
                )
                .ok();
            }
        }
    }

    fn show_help(&self) {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Color::Cyan),
            Print("\n=== Available Commands ===\n\n"),
            ResetColor,
            Print("/help     - Show this help\n"),
            Print("/exit     - Exit the agent\n"),
            Print("/history  - Show conversation history\n\n"),
            SetForegroundColor(Color::Cyan),
            Print("=== Available Tools ===\n\n"),
            ResetColor
        )
        .ok();

        for tool in self.executor.descriptors() {
            execute!(stdout, Print(format!("{:<10} - {}\n", tool.name, tool.description))).ok();
        }
        execute!(stdout, Print("\n")).ok();
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        let cut: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

fn print_assistant(text: &str) {
    let mut stdout = io::stdout();
    execute!(
        stdout,
        SetForegroundColor(Color::Blue),
        Print("Agent> "),
        ResetColor,
        Print(text),
        Print("\n\n")
    )
    .ok();
}

fn print_thinking() {
    let mut stdout = io::stdout();
    execute!(
        stdout,
        SetForegroundColor(Color::Yellow),
        Print("Agent> "),
        SetForegroundColor(Color::Grey),
        Print("[thinking...]\n"),
        ResetColor
    )
    .ok();
}

fn print_tool(tool: &str, param: &str) {
    let mut stdout = io::stdout();
    execute!(
        stdout,
        SetForegroundColor(Color::Magenta),
        Print("  [TOOL] "),
        SetForegroundColor(Color::White),
        Print(tool),
        SetForegroundColor(Color::Grey),
        Print(": "),
        Print(preview(param, 60)),
        Print("\n"),
        ResetColor
    )
    .ok();
}

fn print_result(result: &str, is_error: bool) {
    let mut stdout = io::stdout();
    let (label, color) = if is_error {
        ("  [ERROR] ", Color::Red)
    } else {
        ("  [RESULT] ", Color::Green)
    };
    execute!(
        stdout,
        SetForegroundColor(color),
        Print(label),
        SetForegroundColor(Color::Grey),
        Print(preview(result, 200)),
        Print("\n\n"),
        ResetColor
    )
    .ok();
}

pub fn print_info(text: &str) {
    let mut stdout = io::stdout();
    execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("Info: "),
        ResetColor,
        Print(text),
        Print("\n\n")
    )
    .ok();
}

pub fn print_error(text: &str) {
    let mut stdout = io::stdout();
    execute!(
        stdout,
        SetForegroundColor(Color::Red),
        Print("Error: "),
        ResetColor,
        Print(text),
        Print("\n\n")
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ToolInvocationResult;
    use crate::tools::{ToolDescriptor, ToolRegistry};
    use async_trait::async_trait;
    use color_eyre::eyre::eyre;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Replays canned model turns and records the conversation it was sent.
    struct ScriptedGateway {
        turns: Mutex<VecDeque<Message>>,
        seen: Arc<Mutex<Vec<Vec<Message>>>>,
    }

    impl ScriptedGateway {
        fn new(turns: Vec<Message>) -> (Self, Arc<Mutex<Vec<Vec<Message>>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let gateway = Self {
                turns: Mutex::new(turns.into()),
                seen: Arc::clone(&seen),
            };
            (gateway, seen)
        }
    }

    #[async_trait]
    impl InferenceGateway for ScriptedGateway {
        async fn send(&self, conversation: &[Message], tools: &[ToolDescriptor]) -> Result<Message> {
            assert_eq!(tools.len(), 3);
            self.seen.lock().unwrap().push(conversation.to_vec());
            self.turns
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| eyre!("gateway unavailable"))
        }
    }

    struct ScriptedInput {
        lines: VecDeque<String>,
        reads: Arc<Mutex<usize>>,
    }

    impl ScriptedInput {
        fn new(lines: &[&str]) -> (Self, Arc<Mutex<usize>>) {
            let reads = Arc::new(Mutex::new(0));
            let input = Self {
                lines: lines.iter().map(|l| l.to_string()).collect(),
                reads: Arc::clone(&reads),
            };
            (input, reads)
        }
    }

    impl UserInput for ScriptedInput {
        fn read_line(&mut self) -> Option<String> {
            *self.reads.lock().unwrap() += 1;
            self.lines.pop_front()
        }
    }

    fn model_text(text: &str) -> Message {
        Message {
            role: Role::Model,
            content: vec![ContentBlock::Text(text.to_string())],
        }
    }

    fn model_calls(calls: &[(&str, &str, serde_json::Value)]) -> Message {
        Message {
            role: Role::Model,
            content: calls
                .iter()
                .map(|(id, name, input)| {
                    ContentBlock::ToolInvocationRequest(ToolInvocationRequest {
                        id: id.to_string(),
                        name: name.to_string(),
                        raw_input: input.clone(),
                    })
                })
                .collect(),
        }
    }

    fn results_of(message: &Message) -> Vec<ToolInvocationResult> {
        message
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolInvocationResult(result) => Some(result.clone()),
                _ => None,
            })
            .collect()
    }

    fn executor(root: &std::path::Path) -> ToolExecutor {
        ToolExecutor::new(ToolRegistry::builtin().unwrap(), root)
    }

    #[tokio::test]
    async fn test_text_turn_returns_to_user() {
        let dir = tempdir().unwrap();
        let (gateway, seen) = ScriptedGateway::new(vec![model_text("hi"), model_text("bye")]);
        let (input, reads) = ScriptedInput::new(&["hello", "thanks"]);

        let mut session = ChatSession::new(gateway, executor(dir.path()), input);
        session.run().await.unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(*reads.lock().unwrap(), 3);
        assert_eq!(session.conversation().len(), 4);
    }

    #[tokio::test]
    async fn test_tool_turn_bundles_results_and_reinfers_without_input() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f.txt"), "no quotes, no doubt").unwrap();

        let (gateway, seen) = ScriptedGateway::new(vec![
            model_calls(&[
                ("call_1", "read_file", json!({ "path": "f.txt" })),
                ("call_2", "edit_file", json!({ "path": "f.txt", "old_str": "no", "new_str": "yes" })),
                ("call_3", "run_shell", json!({ "cmd": "ls" })),
            ]),
            model_text("done"),
        ]);
        let (input, reads) = ScriptedInput::new(&["edit it"]);

        let mut session = ChatSession::new(gateway, executor(dir.path()), input);
        session.run().await.unwrap();

        // one line, then end of input
        assert_eq!(*reads.lock().unwrap(), 2);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        let second_call = &seen[1];
        assert_eq!(second_call.len(), 3);

        let bundle = &second_call[2];
        assert_eq!(bundle.role, Role::User);
        let results = results_of(bundle);
        assert_eq!(bundle.content.len(), 3);
        let ids: Vec<&str> = results.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);
        assert_eq!(results[0].output, "no quotes, no doubt");
        assert_eq!(results[1].output, "OK");
        assert!(results[2].is_error);
        assert_eq!(results[2].output, "tool not found");

        assert_eq!(
            fs::read_to_string(dir.path().join("f.txt")).unwrap(),
            "yes quotes, no doubt"
        );
        assert_eq!(session.conversation().len(), 4);
    }

    #[tokio::test]
    async fn test_commands_and_blank_lines_never_reach_the_model() {
        let dir = tempdir().unwrap();
        let (gateway, seen) = ScriptedGateway::new(vec![]);
        let (input, _) = ScriptedInput::new(&["", "   ", "/help", "/history", "/exit", "ignored"]);

        let mut session = ChatSession::new(gateway, executor(dir.path()), input);
        session.run().await.unwrap();

        assert!(seen.lock().unwrap().is_empty());
        assert!(session.conversation().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let (gateway, _) = ScriptedGateway::new(vec![]);
        let (input, reads) = ScriptedInput::new(&["hello", "again"]);

        let mut session = ChatSession::new(gateway, executor(dir.path()), input);
        let err = session.run().await.unwrap_err();

        assert!(err.to_string().contains("gateway unavailable"));
        assert_eq!(*reads.lock().unwrap(), 1);
        assert_eq!(session.conversation().len(), 1);
    }

    #[tokio::test]
    async fn test_user_line_is_stored_as_typed() {
        let dir = tempdir().unwrap();
        let (gateway, seen) = ScriptedGateway::new(vec![model_text("ok")]);
        let (input, _) = ScriptedInput::new(&["  indented request  "]);

        let mut session = ChatSession::new(gateway, executor(dir.path()), input);
        session.run().await.unwrap();

        assert_eq!(
            seen.lock().unwrap()[0],
            vec![Message::user_text("  indented request  ")]
        );
    }

    #[test]
    fn test_reader_input_skips_invalid_utf8_and_strips_line_endings() {
        let bytes: &[u8] = b"hello\r\n\xff\xfe\nworld\n";
        let mut input = ReaderInput::new(io::Cursor::new(bytes));

        assert_eq!(input.read_line().as_deref(), Some("hello"));
        assert_eq!(input.read_line().as_deref(), Some("world"));
        assert_eq!(input.read_line(), None);
    }

    #[test]
    fn test_preview_truncates_on_char_boundary() {
        assert_eq!(preview("short", 10), "short");
        assert_eq!(preview("ééééééééééé", 6), "ééé...");
    }
}
