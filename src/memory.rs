use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many recent interactions a relationship keeps after a merge.
const MAX_RECENT_INTERACTIONS: usize = 5;
/// How many session summaries persist; the prompt shows only a recent slice.
const MAX_STORED_SUMMARIES: usize = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub registered: bool,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}

/// What the persona has learned about one board.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoardKnowledge {
    #[serde(default)]
    pub board_name: String,
    #[serde(default)]
    pub software: String,
    #[serde(default)]
    pub menus: String,
    #[serde(default)]
    pub message_bases: Vec<String>,
    #[serde(default)]
    pub file_areas: Vec<String>,
    #[serde(default)]
    pub door_games: Vec<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Ally,
    Rival,
    Neutral,
    Enemy,
    Mentor,
    Annoyance,
}

impl Default for Role {
    fn default() -> Self {
        Role::Neutral
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Ally => write!(f, "ally"),
            Role::Rival => write!(f, "rival"),
            Role::Neutral => write!(f, "neutral"),
            Role::Enemy => write!(f, "enemy"),
            Role::Mentor => write!(f, "mentor"),
            Role::Annoyance => write!(f, "annoyance"),
        }
    }
}

/// One other user of the board, as this persona sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(default)]
    pub role: Role,
    pub trust: u8,
    pub respect: u8,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub recent_interactions: Vec<String>,
}

impl Default for Relationship {
    fn default() -> Self {
        Relationship {
            role: Role::Neutral,
            trust: 5,
            respect: 5,
            notes: String::new(),
            recent_interactions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plot {
    pub id: String,
    pub started: DateTime<Utc>,
    #[serde(default)]
    pub collaborators: Vec<String>,
    #[serde(default)]
    pub adversaries: Vec<String>,
    pub description: String,
    #[serde(default)]
    pub next_steps: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plots {
    #[serde(default)]
    pub active: Vec<Plot>,
    #[serde(default)]
    pub completed: Vec<Plot>,
}

/// The structured update distilled from a session transcript. Parsed from
/// the extraction model's JSON; every field is optional so a partial answer
/// still merges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub credentials: Option<Credentials>,
    #[serde(default)]
    pub knowledge: Option<BoardKnowledge>,
    #[serde(default)]
    pub relationships: HashMap<String, Relationship>,
    #[serde(default)]
    pub plots: Vec<Plot>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Everything one persona remembers about one board, keyed by
/// `(host, handle)` on disk. Read at session start, written at session end;
/// never shared between live sessions.
#[derive(Debug, Clone)]
pub struct AgentMemory {
    base_dir: PathBuf,
    pub host: String,
    pub handle: String,
    pub credentials: Credentials,
    pub knowledge: BoardKnowledge,
    pub relationships: HashMap<String, Relationship>,
    pub plots: Plots,
    pub session_summaries: Vec<String>,
}

impl AgentMemory {
    /// Load memory from `<memory_root>/<host>/<handle>/`. Missing files are
    /// empty defaults; a fresh persona starts with nothing.
    pub fn load(memory_root: &Path, host: &str, handle: &str) -> Result<Self> {
        let base_dir = memory_root.join(host).join(handle);

        let credentials = load_yaml(&base_dir.join("credentials.yaml"))?.unwrap_or_default();
        let knowledge = load_yaml(&base_dir.join("knowledge.yaml"))?.unwrap_or_default();
        let relationships = load_yaml(&base_dir.join("relationships.yaml"))?.unwrap_or_default();
        let plots = load_yaml(&base_dir.join("plots.yaml"))?.unwrap_or_default();
        let session_summaries = load_recent_summaries(&base_dir.join("sessions"));

        Ok(AgentMemory {
            base_dir,
            host: host.to_string(),
            handle: handle.to_string(),
            credentials,
            knowledge,
            relationships,
            plots,
            session_summaries,
        })
    }

    /// Persist every memory document. Each file is written to a temp path
    /// and renamed into place, so a crash mid-write leaves the old file.
    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.base_dir).with_context(|| {
            format!("Failed to create memory directory: {}", self.base_dir.display())
        })?;

        save_yaml(&self.base_dir.join("credentials.yaml"), &self.credentials)?;
        save_yaml(&self.base_dir.join("knowledge.yaml"), &self.knowledge)?;
        save_yaml(&self.base_dir.join("relationships.yaml"), &self.relationships)?;
        save_yaml(&self.base_dir.join("plots.yaml"), &self.plots)?;

        Ok(())
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.base_dir.join("sessions")
    }

    /// Merge an extraction result into memory. Trust and respect clamp to
    /// 1..=10, recent interactions cap at the retention limit, plots upsert
    /// by id and move between active/completed on status.
    pub fn merge(&mut self, update: MemoryUpdate) {
        if let Some(credentials) = update.credentials {
            if !credentials.username.is_empty() {
                self.credentials.username = credentials.username;
            }
            if !credentials.password.is_empty() {
                self.credentials.password = credentials.password;
            }
            self.credentials.registered |= credentials.registered;
            if credentials.last_login.is_some() {
                self.credentials.last_login = credentials.last_login;
            }
        }

        if let Some(knowledge) = update.knowledge {
            merge_string(&mut self.knowledge.board_name, knowledge.board_name);
            merge_string(&mut self.knowledge.software, knowledge.software);
            merge_string(&mut self.knowledge.menus, knowledge.menus);
            merge_string(&mut self.knowledge.notes, knowledge.notes);
            merge_list(&mut self.knowledge.message_bases, knowledge.message_bases);
            merge_list(&mut self.knowledge.file_areas, knowledge.file_areas);
            merge_list(&mut self.knowledge.door_games, knowledge.door_games);
        }

        for (handle, mut incoming) in update.relationships {
            incoming.trust = incoming.trust.clamp(1, 10);
            incoming.respect = incoming.respect.clamp(1, 10);

            let entry = self.relationships.entry(handle).or_default();
            entry.role = incoming.role;
            entry.trust = incoming.trust;
            entry.respect = incoming.respect;
            if !incoming.notes.is_empty() {
                entry.notes = incoming.notes;
            }
            entry.recent_interactions.extend(incoming.recent_interactions);
            if entry.recent_interactions.len() > MAX_RECENT_INTERACTIONS {
                let drop = entry.recent_interactions.len() - MAX_RECENT_INTERACTIONS;
                entry.recent_interactions.drain(..drop);
            }
        }

        for plot in update.plots {
            self.upsert_plot(plot);
        }

        if let Some(summary) = update.summary {
            self.session_summaries.push(summary);
            if self.session_summaries.len() > MAX_STORED_SUMMARIES {
                let drop = self.session_summaries.len() - MAX_STORED_SUMMARIES;
                self.session_summaries.drain(..drop);
            }
        }
    }

    fn upsert_plot(&mut self, plot: Plot) {
        let finished = matches!(plot.status.as_str(), "completed" | "abandoned");

        if let Some(pos) = self.plots.active.iter().position(|p| p.id == plot.id) {
            if finished {
                self.plots.active.remove(pos);
                self.plots.completed.push(plot);
            } else {
                self.plots.active[pos] = plot;
            }
        } else if !self.plots.completed.iter().any(|p| p.id == plot.id) {
            if finished {
                self.plots.completed.push(plot);
            } else {
                self.plots.active.push(plot);
            }
        }
    }

    /// Known users sorted by handle, for stable prompt assembly.
    pub fn relationships_sorted(&self) -> Vec<(&String, &Relationship)> {
        let mut entries: Vec<_> = self.relationships.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

fn merge_string(target: &mut String, incoming: String) {
    if !incoming.is_empty() {
        *target = incoming;
    }
}

fn merge_list(target: &mut Vec<String>, incoming: Vec<String>) {
    for item in incoming {
        if !item.is_empty() && !target.contains(&item) {
            target.push(item);
        }
    }
}

fn load_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read memory file: {}", path.display()))?;
    let value = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse memory file: {}", path.display()))?;
    Ok(Some(value))
}

fn save_yaml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_yaml::to_string(value)
        .with_context(|| format!("Failed to serialize memory file: {}", path.display()))?;

    let tmp = path.with_extension("yaml.tmp");
    std::fs::write(&tmp, content)
        .with_context(|| format!("Failed to write memory file: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to replace memory file: {}", path.display()))?;

    Ok(())
}

fn load_recent_summaries(sessions_dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(sessions_dir) else {
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(".summary.md"))
        .collect();
    // ISO timestamps in the filenames sort chronologically
    paths.sort();

    paths
        .iter()
        .rev()
        .take(MAX_STORED_SUMMARIES)
        .rev()
        .filter_map(|p| std::fs::read_to_string(p).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_memory(dir: &Path) -> AgentMemory {
        AgentMemory::load(dir, "bbs.example.net", "rwilco").unwrap()
    }

    #[test]
    fn test_missing_files_load_as_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let memory = empty_memory(dir.path());
        assert!(!memory.credentials.registered);
        assert!(memory.relationships.is_empty());
        assert!(memory.plots.active.is_empty());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = empty_memory(dir.path());
        memory.credentials.username = "rwilco".to_string();
        memory.credentials.password = "hunter2".to_string();
        memory.credentials.registered = true;
        memory.knowledge.board_name = "The Sanctum".to_string();
        memory.save().unwrap();

        let reloaded = empty_memory(dir.path());
        assert_eq!(reloaded.credentials.username, "rwilco");
        assert!(reloaded.credentials.registered);
        assert_eq!(reloaded.knowledge.board_name, "The Sanctum");
    }

    #[test]
    fn test_merge_clamps_trust_and_respect() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = empty_memory(dir.path());

        let mut update = MemoryUpdate::default();
        update.relationships.insert(
            "phreak".to_string(),
            Relationship {
                role: Role::Rival,
                trust: 0,
                respect: 99,
                notes: "talks big in the games base".to_string(),
                recent_interactions: vec!["argued about LORD strategy".to_string()],
            },
        );
        memory.merge(update);

        let rel = &memory.relationships["phreak"];
        assert_eq!(rel.trust, 1);
        assert_eq!(rel.respect, 10);
        assert_eq!(rel.role, Role::Rival);
    }

    #[test]
    fn test_merge_caps_recent_interactions() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = empty_memory(dir.path());

        for i in 0..4 {
            let mut update = MemoryUpdate::default();
            update.relationships.insert(
                "sysop".to_string(),
                Relationship {
                    recent_interactions: vec![format!("event {}a", i), format!("event {}b", i)],
                    ..Default::default()
                },
            );
            memory.merge(update);
        }

        let rel = &memory.relationships["sysop"];
        assert_eq!(rel.recent_interactions.len(), 5);
        assert_eq!(rel.recent_interactions.last().unwrap(), "event 3b");
    }

    #[test]
    fn test_plot_upsert_and_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = empty_memory(dir.path());

        let mut update = MemoryUpdate::default();
        update.plots.push(Plot {
            id: "trade-war".to_string(),
            started: Utc::now(),
            collaborators: vec!["vex".to_string()],
            adversaries: vec![],
            description: "corner the TradeWars fuel market".to_string(),
            next_steps: "scout sector 42".to_string(),
            status: "active".to_string(),
        });
        memory.merge(update);
        assert_eq!(memory.plots.active.len(), 1);

        let mut update = MemoryUpdate::default();
        update.plots.push(Plot {
            id: "trade-war".to_string(),
            started: Utc::now(),
            collaborators: vec!["vex".to_string()],
            adversaries: vec![],
            description: "corner the TradeWars fuel market".to_string(),
            next_steps: String::new(),
            status: "completed".to_string(),
        });
        memory.merge(update);
        assert!(memory.plots.active.is_empty());
        assert_eq!(memory.plots.completed.len(), 1);
    }

    #[test]
    fn test_summaries_capped_at_ten() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = empty_memory(dir.path());

        for i in 0..12 {
            let update = MemoryUpdate {
                summary: Some(format!("session {}", i)),
                ..Default::default()
            };
            memory.merge(update);
        }

        assert_eq!(memory.session_summaries.len(), 10);
        assert_eq!(memory.session_summaries[0], "session 2");
        assert_eq!(memory.session_summaries[9], "session 11");
    }

    #[test]
    fn test_merge_lists_dedupe() {
        let dir = tempfile::tempdir().unwrap();
        let mut memory = empty_memory(dir.path());
        memory.knowledge.message_bases = vec!["General".to_string()];

        let update = MemoryUpdate {
            knowledge: Some(BoardKnowledge {
                message_bases: vec!["General".to_string(), "Trading Post".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        };
        memory.merge(update);

        assert_eq!(
            memory.knowledge.message_bases,
            vec!["General".to_string(), "Trading Post".to_string()]
        );
    }
}
