use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::memory::{AgentMemory, MemoryUpdate};
use crate::persona::Persona;
use crate::provider::{Brain, ChatMessage};
use crate::transcript::SessionTranscript;

const EXTRACTION_INSTRUCTIONS: &str = "\
You distill a BBS session transcript into structured memory for the persona
who lived it. Reply with a single JSON object and nothing else:

{
  \"credentials\": {\"username\": \"\", \"password\": \"\", \"registered\": false} or null,
  \"knowledge\": {\"board_name\": \"\", \"software\": \"\", \"menus\": \"\",
                \"message_bases\": [], \"file_areas\": [], \"door_games\": [],
                \"notes\": \"\"} or null,
  \"relationships\": {\"<handle>\": {\"role\": \"ally|rival|neutral|enemy|mentor|annoyance\",
                     \"trust\": 1-10, \"respect\": 1-10, \"notes\": \"\",
                     \"recent_interactions\": [\"...\"]}},
  \"plots\": [{\"id\": \"kebab-case-id\", \"started\": \"<ISO8601>\",
             \"collaborators\": [], \"adversaries\": [], \"description\": \"\",
             \"next_steps\": \"\", \"status\": \"active|completed|abandoned\"}],
  \"summary\": \"2-4 sentences on what happened this session\"
}

Only include what the transcript supports. Omit sections with nothing new.";

/// Distill a finished session into a memory update and persist it. The
/// caller treats any error here as log-and-continue; a failed extraction
/// must never take the session down with it.
pub async fn extract_and_merge(
    brain: &dyn Brain,
    persona: &Persona,
    memory: &mut AgentMemory,
    transcript: &SessionTranscript,
) -> Result<()> {
    let user = format!(
        "Persona: {} ({}) on {}\n\n=== Transcript ===\n{}",
        persona.name,
        persona.handle,
        memory.host,
        transcript.render()
    );

    let mut messages = vec![
        ChatMessage::system(EXTRACTION_INSTRUCTIONS),
        ChatMessage::user(user),
    ];
    // the notes the agent flagged mid-session ride along as its own turn
    if !transcript.memory_notes.is_empty() {
        let notes = transcript
            .memory_notes
            .iter()
            .map(|note| format!("- {}", note))
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(ChatMessage::assistant(format!(
            "Notes I flagged during the session:\n{}",
            notes
        )));
    }
    let response = brain
        .complete(&messages)
        .await
        .context("Memory extraction call failed")?;

    let update = parse_update(&response).context("Memory extraction returned unusable JSON")?;
    let summary = update.summary.clone();

    memory.merge(update);
    memory.save()?;

    if let Some(summary) = summary {
        transcript.write_summary(&memory.sessions_dir(), &summary)?;
    }

    info!(handle = %memory.handle, host = %memory.host, "memory extracted and saved");
    Ok(())
}

/// Pull the JSON object out of a model response that may wrap it in fences
/// or prose.
fn parse_update(response: &str) -> Result<MemoryUpdate> {
    let start = response.find('{').context("No JSON object in response")?;
    let end = response.rfind('}').context("No JSON object in response")?;
    if end < start {
        anyhow::bail!("No JSON object in response");
    }

    let json = &response[start..=end];
    debug!(len = json.len(), "parsing extraction payload");
    serde_json::from_str(json).context("Failed to parse memory update")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let update = parse_update(r#"{"summary": "met the sysop"}"#).unwrap();
        assert_eq!(update.summary.as_deref(), Some("met the sysop"));
    }

    #[test]
    fn test_parse_fenced_json() {
        let response = "Here is the update:\n```json\n{\"summary\": \"quiet night\",\n \"relationships\": {\"vex\": {\"role\": \"ally\", \"trust\": 7, \"respect\": 6}}}\n```";
        let update = parse_update(response).unwrap();
        assert_eq!(update.summary.as_deref(), Some("quiet night"));
        assert_eq!(update.relationships["vex"].trust, 7);
    }

    #[test]
    fn test_parse_garbage_fails() {
        assert!(parse_update("no json here").is_err());
        assert!(parse_update("").is_err());
    }

    #[test]
    fn test_partial_update_parses() {
        let update = parse_update(r#"{"plots": []}"#).unwrap();
        assert!(update.credentials.is_none());
        assert!(update.relationships.is_empty());
    }
}
