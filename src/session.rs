use crate::client::{LlmClient, CONNECT_ERROR_PREFIX};
use crate::extract::extract_first_fence;
use crate::protocol::{ChatMessage, Role};
use crate::sandbox::{self, CompileOutcome, ExecResult};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

pub const EXECUTION_RESULT_PREFIX: &str = "Code Execution Result:";
pub const EXECUTION_ERROR_PREFIX: &str = "Error executing code:";

/// One exchange unit of a session. Immutable once appended.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub has_code: bool,
    pub code_block: Option<String>,
    pub is_error: bool,
    pub is_execution_result: bool,
}

impl ChatTurn {
    fn new(role: Role, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text,
            created_at: Utc::now(),
            has_code: false,
            code_block: None,
            is_error: false,
            is_execution_result: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TurnAppended(ChatTurn),
    BusyChanged(bool),
}

/// Orchestrates one chat session: append-only turn list, a busy guard
/// around the send cycle, and a broadcast feed the frontend renders from.
pub struct Session {
    client: LlmClient,
    turns: Mutex<Vec<ChatTurn>>,
    busy: Mutex<bool>,
    events: broadcast::Sender<SessionEvent>,
    exec_timeout: Duration,
}

impl Session {
    pub fn new(client: LlmClient) -> Self {
        let (events, _) = broadcast::channel(200);
        Self {
            client,
            turns: Mutex::new(Vec::new()),
            busy: Mutex::new(false),
            events,
            exec_timeout: sandbox::DEFAULT_EXEC_TIMEOUT,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn turns(&self) -> Vec<ChatTurn> {
        self.turns.lock().await.clone()
    }

    pub async fn busy(&self) -> bool {
        *self.busy.lock().await
    }

    /// Send one user message and append the assistant's answer.
    ///
    /// Blank input is rejected silently: no turn, no network call. A send
    /// while another is in flight is rejected here rather than relying on
    /// the frontend to disable its input. The busy flag drops on every exit.
    pub async fn send_user_message(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }

        {
            let mut busy = self.busy.lock().await;
            if *busy {
                tracing::warn!("send rejected: a request is already in flight");
                return;
            }
            *busy = true;
        }
        let _ = self.events.send(SessionEvent::BusyChanged(true));

        self.append(ChatTurn::new(Role::User, text.to_string()))
            .await;

        let history = self.history().await;
        let answer = self.client.chat(&history).await;
        self.append(assistant_turn(answer)).await;

        *self.busy.lock().await = false;
        let _ = self.events.send(SessionEvent::BusyChanged(false));
    }

    /// Compile and run the code block stored on `turn_id`, appending a fresh
    /// result turn. The original turn is never mutated. A turn without code
    /// (or an unknown id) is ignored.
    pub async fn execute_code(&self, turn_id: Uuid) {
        let code = {
            let turns = self.turns.lock().await;
            turns
                .iter()
                .find(|turn| turn.id == turn_id)
                .and_then(|turn| turn.code_block.clone())
        };
        let Some(code) = code else {
            tracing::warn!(%turn_id, "execute requested for a turn with no code");
            return;
        };

        let outcome = match sandbox::compile(&code).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.append(execution_error_turn(err.to_string())).await;
                return;
            }
        };

        let turn = match outcome {
            CompileOutcome::Diagnostics(diagnostics) => {
                execution_result_turn(diagnostics.join("\n"))
            }
            CompileOutcome::Executable(program) => {
                match sandbox::run(&program, self.exec_timeout).await {
                    ExecResult::Output(output) => execution_result_turn(output),
                    ExecResult::Failure(message) => execution_error_turn(message),
                }
            }
        };
        self.append(turn).await;
    }

    async fn append(&self, turn: ChatTurn) {
        self.turns.lock().await.push(turn.clone());
        let _ = self.events.send(SessionEvent::TurnAppended(turn));
    }

    // Dialogue turns only: execution results and error answers are session
    // artifacts, not model conversation.
    async fn history(&self) -> Vec<ChatMessage> {
        self.turns
            .lock()
            .await
            .iter()
            .filter(|turn| !turn.is_execution_result && !turn.is_error)
            .map(|turn| ChatMessage {
                role: turn.role,
                content: turn.text.clone(),
            })
            .collect()
    }
}

fn assistant_turn(answer: String) -> ChatTurn {
    let mut turn = ChatTurn::new(Role::Assistant, answer);
    if turn.text.starts_with(CONNECT_ERROR_PREFIX) {
        turn.is_error = true;
        return turn;
    }
    match extract_first_fence(&turn.text) {
        Some(extracted) if !extracted.code.is_empty() => {
            turn.text = extracted.remainder;
            turn.has_code = true;
            turn.code_block = Some(extracted.code);
        }
        _ => {}
    }
    turn
}

fn execution_result_turn(content: String) -> ChatTurn {
    let mut turn = ChatTurn::new(Role::Assistant, format!("{EXECUTION_RESULT_PREFIX}\n{content}"));
    turn.is_execution_result = true;
    turn
}

fn execution_error_turn(message: String) -> ChatTurn {
    let mut turn = ChatTurn::new(Role::Assistant, format!("{EXECUTION_ERROR_PREFIX}\n{message}"));
    turn.is_execution_result = true;
    turn.is_error = true;
    turn
}
