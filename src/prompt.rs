use crate::memory::AgentMemory;
use crate::persona::Persona;

/// The fixed action-format contract the model must follow. One action per
/// line, recognized prefixes only.
const ACTION_FORMAT: &str = "\
RESPONSE FORMAT - emit one action per line, using only these prefixes:
THINKING: <private reasoning, never sent to the board>
LINE: <text to type, followed by enter>
TYPE: <text to type, no enter>
KEY: <enter|esc|space|backspace|tab|y|n|or a single character>
WAIT: <milliseconds, 0-30000>
MEMORY: <a fact worth remembering after this session>
DISCONNECT: <reason for logging off>

Type like the person you are, typos and all. Never mention being an AI.";

/// Assemble the per-session system message from the persona and a memory
/// snapshot. Built once at session start; the per-turn context is only ever
/// the screen.
pub fn build_system_prompt(persona: &Persona, memory: &AgentMemory) -> String {
    let mut prompt = String::new();

    prompt.push_str(&format!(
        "You are {} (\"{}\"), a {}-year-old {} from {}. Archetype: {}.\n\n",
        persona.name,
        persona.handle,
        persona.age,
        persona.occupation,
        persona.location,
        persona.archetype
    ));

    prompt.push_str("PERSONALITY\n");
    prompt.push_str(&format!("Traits: {}\n", persona.personality.traits.join(", ")));
    prompt.push_str(&format!("Interests: {}\n", persona.personality.interests.join(", ")));
    prompt.push_str(&format!("Writing style: {}\n", persona.personality.writing_style));
    prompt.push_str(&format!("Hot buttons: {}\n", persona.personality.hot_buttons));
    prompt.push_str(&format!(
        "Social tendencies: {}\n\n",
        persona.personality.social_tendencies
    ));

    if !persona.behavior.goals.is_empty() {
        prompt.push_str("GOALS\n");
        for goal in &persona.behavior.goals {
            prompt.push_str(&format!("- {}\n", goal));
        }
        prompt.push('\n');
    }

    if !persona.behavior.avoid.is_empty() {
        prompt.push_str("AVOID\n");
        for item in &persona.behavior.avoid {
            prompt.push_str(&format!("- {}\n", item));
        }
        prompt.push('\n');
    }

    prompt.push_str("ACCOUNT\n");
    if memory.credentials.registered {
        prompt.push_str(&format!(
            "You already have an account. Username: {} Password: {}\n",
            memory.credentials.username, memory.credentials.password
        ));
        prompt.push_str("Log in with these credentials; do not register again.\n\n");
    } else {
        prompt.push_str("You have no account on this board yet. If offered, register as a new user using:\n");
        prompt.push_str(&format!(
            "Real name: {} / Email: {} / Voice phone: {} / Birth date: {}\n",
            persona.registration.real_name,
            persona.registration.email,
            persona.registration.voice_phone,
            persona.registration.birth_date
        ));
        prompt.push_str(&format!(
            "Pick \"{}\" as your handle and invent a password you can remember. Record both with MEMORY lines.\n\n",
            persona.handle
        ));
    }

    if !memory.knowledge.board_name.is_empty() || !memory.knowledge.notes.is_empty() {
        prompt.push_str("WHAT YOU KNOW ABOUT THIS BOARD\n");
        if !memory.knowledge.board_name.is_empty() {
            prompt.push_str(&format!(
                "{} (software: {})\n",
                memory.knowledge.board_name, memory.knowledge.software
            ));
        }
        if !memory.knowledge.menus.is_empty() {
            prompt.push_str(&format!("Menus: {}\n", memory.knowledge.menus));
        }
        if !memory.knowledge.message_bases.is_empty() {
            prompt.push_str(&format!(
                "Message bases: {}\n",
                memory.knowledge.message_bases.join(", ")
            ));
        }
        if !memory.knowledge.file_areas.is_empty() {
            prompt.push_str(&format!("File areas: {}\n", memory.knowledge.file_areas.join(", ")));
        }
        if !memory.knowledge.door_games.is_empty() {
            prompt.push_str(&format!("Door games: {}\n", memory.knowledge.door_games.join(", ")));
        }
        if !memory.knowledge.notes.is_empty() {
            prompt.push_str(&format!("Notes: {}\n", memory.knowledge.notes));
        }
        prompt.push('\n');
    }

    let relationships = memory.relationships_sorted();
    if !relationships.is_empty() {
        prompt.push_str("PEOPLE YOU KNOW HERE\n");
        for (handle, rel) in relationships {
            prompt.push_str(&format!(
                "{} - {} (trust {}/10, respect {}/10)",
                handle, rel.role, rel.trust, rel.respect
            ));
            if !rel.notes.is_empty() {
                prompt.push_str(&format!(": {}", rel.notes));
            }
            prompt.push('\n');
            for interaction in &rel.recent_interactions {
                prompt.push_str(&format!("  recently: {}\n", interaction));
            }
        }
        prompt.push('\n');
    }

    if !memory.plots.active.is_empty() {
        prompt.push_str("ONGOING PLOTS\n");
        for plot in &memory.plots.active {
            prompt.push_str(&format!("- {}: {}", plot.id, plot.description));
            if !plot.next_steps.is_empty() {
                prompt.push_str(&format!(" Next: {}", plot.next_steps));
            }
            if !plot.collaborators.is_empty() {
                prompt.push_str(&format!(" (with {})", plot.collaborators.join(", ")));
            }
            prompt.push('\n');
        }
        prompt.push('\n');
    }

    if !memory.session_summaries.is_empty() {
        prompt.push_str("LAST SESSIONS\n");
        // memory retains more history than the model needs to see
        for summary in memory.session_summaries.iter().rev().take(3).rev() {
            prompt.push_str(&format!("- {}\n", summary.trim()));
        }
        prompt.push('\n');
    }

    prompt.push_str(ACTION_FORMAT);
    prompt
}

/// The per-turn user message. Early turns carry up to two prior screens so
/// the model can see what changed since it acted.
pub fn build_user_message(turn: u32, prior_screens: &[String], screen: &str) -> String {
    let mut message = format!("[Turn {}]\n\n", turn);

    if turn <= 3 {
        for prior in prior_screens.iter().rev().take(2).rev() {
            message.push_str(&format!("--- Earlier screen ---\n{}\n\n", prior));
        }
    }

    message.push_str(&format!(
        "--- Current screen ---\n{}\n--- End screen ---\n\nWhat do you do?",
        screen
    ));
    message
}
