//! Interaction contracts.
//!
//! Every user-facing prompt in the pipeline is governed by exactly one
//! contract: its default timeout, the reprompt spoken on unrecognized input,
//! the text spoken on expiry, and the intents the prompt accepts. The state
//! machine reads all prompt strings from this table; no other component
//! hard-codes them.

use std::time::Duration;

/// How long before expiry the warning earcon fires, for every contract.
pub const WARNING_LEAD: Duration = Duration::from_secs(5);

/// Identifier of one interaction contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractId {
    /// "Which channel?" numbered menu.
    ChannelSelection,
    /// Queue / wait / cancel after an ask-mode prompt.
    QueueChoice,
    /// Read / prompt / cancel after a channel switch.
    SwitchChoice,
    /// Forum name step of the new-post flow.
    NewPostForum,
    /// Title step of the new-post flow.
    NewPostTitle,
    /// Body step of the new-post flow.
    NewPostBody,
}

impl ContractId {
    /// Stable contract name.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ChannelSelection => "channel-selection",
            Self::QueueChoice => "queue-choice",
            Self::SwitchChoice => "switch-choice",
            Self::NewPostForum => "new-post-forum",
            Self::NewPostTitle => "new-post-title",
            Self::NewPostBody => "new-post-body",
        }
    }
}

/// Intent families a prompt can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentTag {
    /// A numbered or named channel pick.
    ChannelPick,
    /// Queue / wait / silent / cancel.
    QueueChoice,
    /// Read / prompt / cancel.
    SwitchChoice,
    /// A forum name.
    ForumName,
    /// Free text used as a post title.
    PostTitle,
    /// Free text used as a post body.
    PostBody,
    /// Global navigation commands (switch, list, default, inbox) that exit
    /// any menu.
    Navigation,
}

/// One interaction contract.
#[derive(Debug, Clone, Copy)]
pub struct InteractionContract {
    /// Contract identifier.
    pub id: ContractId,
    /// Default expiry when the entering event carries no override.
    pub default_timeout: Duration,
    /// Spoken when the user's input matches no accepted intent.
    pub reprompt_text: &'static str,
    /// Spoken when the contract expires.
    pub timeout_text: &'static str,
    /// Intents this prompt accepts.
    pub accepted: &'static [IntentTag],
}

static CHANNEL_SELECTION: InteractionContract = InteractionContract {
    id: ContractId::ChannelSelection,
    default_timeout: Duration::from_secs(15),
    reprompt_text: "Say a number or a channel name, or say cancel.",
    timeout_text: "Channel selection timed out.",
    accepted: &[IntentTag::ChannelPick, IntentTag::Navigation],
};

static QUEUE_CHOICE: InteractionContract = InteractionContract {
    id: ContractId::QueueChoice,
    default_timeout: Duration::from_secs(20),
    reprompt_text: "Say queue to leave it in the inbox, wait to hold on, or cancel.",
    timeout_text: "No choice heard. The response will land in your inbox.",
    accepted: &[IntentTag::QueueChoice, IntentTag::Navigation],
};

static SWITCH_CHOICE: InteractionContract = InteractionContract {
    id: ContractId::SwitchChoice,
    default_timeout: Duration::from_secs(30),
    reprompt_text: "Say read to hear the last message, prompt to send a new one, or cancel.",
    timeout_text: "Okay, staying put.",
    accepted: &[IntentTag::SwitchChoice, IntentTag::Navigation],
};

static NEW_POST_FORUM: InteractionContract = InteractionContract {
    id: ContractId::NewPostForum,
    default_timeout: Duration::from_secs(30),
    reprompt_text: "Which forum should the post go in?",
    timeout_text: "Post creation timed out.",
    accepted: &[IntentTag::ForumName, IntentTag::Navigation],
};

static NEW_POST_TITLE: InteractionContract = InteractionContract {
    id: ContractId::NewPostTitle,
    default_timeout: Duration::from_secs(30),
    reprompt_text: "What should the post be called?",
    timeout_text: "Post creation timed out.",
    accepted: &[IntentTag::PostTitle, IntentTag::Navigation],
};

static NEW_POST_BODY: InteractionContract = InteractionContract {
    id: ContractId::NewPostBody,
    default_timeout: Duration::from_secs(60),
    reprompt_text: "Go ahead with the body of the post.",
    timeout_text: "Post creation timed out.",
    accepted: &[IntentTag::PostBody, IntentTag::Navigation],
};

/// The six built-in contracts.
static CONTRACTS: [&InteractionContract; 6] = [
    &CHANNEL_SELECTION,
    &QUEUE_CHOICE,
    &SWITCH_CHOICE,
    &NEW_POST_FORUM,
    &NEW_POST_TITLE,
    &NEW_POST_BODY,
];

/// Look up a contract by id.
///
/// Exhaustive: a new [`ContractId`] variant without a contract fails to
/// compile here.
#[must_use]
pub fn contract(id: ContractId) -> &'static InteractionContract {
    match id {
        ContractId::ChannelSelection => &CHANNEL_SELECTION,
        ContractId::QueueChoice => &QUEUE_CHOICE,
        ContractId::SwitchChoice => &SWITCH_CHOICE,
        ContractId::NewPostForum => &NEW_POST_FORUM,
        ContractId::NewPostTitle => &NEW_POST_TITLE,
        ContractId::NewPostBody => &NEW_POST_BODY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn six_contracts_with_fixed_timeouts() {
        assert_eq!(CONTRACTS.len(), 6);
        assert_eq!(
            contract(ContractId::ChannelSelection).default_timeout,
            Duration::from_secs(15)
        );
        assert_eq!(contract(ContractId::QueueChoice).default_timeout, Duration::from_secs(20));
        assert_eq!(contract(ContractId::SwitchChoice).default_timeout, Duration::from_secs(30));
        assert_eq!(contract(ContractId::NewPostForum).default_timeout, Duration::from_secs(30));
        assert_eq!(contract(ContractId::NewPostTitle).default_timeout, Duration::from_secs(30));
        assert_eq!(contract(ContractId::NewPostBody).default_timeout, Duration::from_secs(60));
    }

    #[test]
    fn lookup_returns_matching_id() {
        for c in &CONTRACTS {
            assert_eq!(contract(c.id).id, c.id);
        }
    }

    #[test]
    fn warning_lead_is_five_seconds() {
        assert_eq!(WARNING_LEAD, Duration::from_secs(5));
    }

    #[test]
    fn every_contract_has_prompt_texts() {
        for c in &CONTRACTS {
            assert!(!c.reprompt_text.is_empty(), "{}", c.id.name());
            assert!(!c.timeout_text.is_empty(), "{}", c.id.name());
            assert!(!c.accepted.is_empty(), "{}", c.id.name());
        }
    }

    #[test]
    fn menus_accept_navigation_exits() {
        for c in &CONTRACTS {
            assert!(c.accepted.contains(&IntentTag::Navigation), "{}", c.id.name());
        }
    }
}
