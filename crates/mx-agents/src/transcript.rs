//! Budget-capped conversation transcript for the implementation loop.
//!
//! The system prompt and task statement are pinned and always sent.
//! Later turns are kept in a window: when the character budget is
//! exceeded, the oldest turns are dropped and a truncation marker is
//! inserted so the model knows context was lost. Orphaned tool-result
//! turns are dropped together with the call they answer.

use std::collections::VecDeque;

use mx_harness::provider::{Message, Role};

const TRUNCATION_MARKER: &str = "[earlier turns omitted to fit the context window]";

pub struct Transcript {
    pinned: Vec<Message>,
    turns: VecDeque<Message>,
    budget_chars: usize,
    truncated: bool,
}

impl Transcript {
    /// `pinned` messages are never evicted; they count against the budget.
    pub fn new(pinned: Vec<Message>, budget_chars: usize) -> Self {
        Self {
            pinned,
            turns: VecDeque::new(),
            budget_chars,
            truncated: false,
        }
    }

    pub fn push(&mut self, message: Message) {
        self.turns.push_back(message);
        self.enforce_budget();
    }

    /// Full message list for the next provider call.
    pub fn messages(&self) -> Vec<Message> {
        let mut out = self.pinned.clone();
        if self.truncated {
            out.push(Message::user(TRUNCATION_MARKER));
        }
        out.extend(self.turns.iter().cloned());
        out
    }

    pub fn chars_used(&self) -> usize {
        self.pinned
            .iter()
            .chain(self.turns.iter())
            .map(|m| m.content.len())
            .sum()
    }

    pub fn was_truncated(&self) -> bool {
        self.truncated
    }

    fn enforce_budget(&mut self) {
        // Always keep the newest turn, however large.
        while self.chars_used() > self.budget_chars && self.turns.len() > 1 {
            self.turns.pop_front();
            self.truncated = true;
            // Tool results answering the dropped call go with it.
            while self.turns.len() > 1
                && self.turns.front().map(|m| m.role) == Some(Role::Tool)
            {
                self.turns.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript(budget: usize) -> Transcript {
        Transcript::new(
            vec![Message::system("sys"), Message::user("task")],
            budget,
        )
    }

    #[test]
    fn pinned_messages_always_lead() {
        let mut t = transcript(10_000);
        t.push(Message::assistant("working on it"));
        let msgs = t.messages();
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[1].content, "task");
        assert_eq!(msgs[2].content, "working on it");
        assert!(!t.was_truncated());
    }

    #[test]
    fn oldest_turns_are_evicted_under_pressure() {
        let mut t = transcript(120);
        t.push(Message::assistant("a".repeat(50)));
        t.push(Message::assistant("b".repeat(50)));
        t.push(Message::assistant("c".repeat(50)));

        assert!(t.was_truncated());
        let msgs = t.messages();
        // pinned, marker, survivors
        assert_eq!(msgs[2].content, TRUNCATION_MARKER);
        assert!(msgs.last().unwrap().content.starts_with('c'));
        assert!(!msgs.iter().any(|m| m.content.starts_with('a')));
    }

    #[test]
    fn orphaned_tool_results_are_dropped_with_their_call() {
        let mut t = transcript(140);
        t.push(Message::assistant("x".repeat(60)));
        t.push(Message::tool_result("call_1", "read_file", "y".repeat(60)));
        t.push(Message::assistant("z".repeat(60)));

        let msgs = t.messages();
        // No tool result may lead the window without its call.
        let first_turn = msgs
            .iter()
            .find(|m| m.role == Role::Tool || m.content.starts_with(['x', 'y', 'z']))
            .unwrap();
        assert_ne!(first_turn.role, Role::Tool);
    }

    #[test]
    fn newest_turn_survives_even_when_oversized() {
        let mut t = transcript(50);
        t.push(Message::assistant("small"));
        t.push(Message::assistant("h".repeat(500)));

        let msgs = t.messages();
        assert!(msgs.last().unwrap().content.starts_with('h'));
    }

    #[test]
    fn chars_used_counts_pinned_and_turns() {
        let mut t = transcript(10_000);
        let base = t.chars_used();
        t.push(Message::assistant("12345"));
        assert_eq!(t.chars_used(), base + 5);
    }
}
