use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// A named identity one agent embodies on the boards. Loaded once at process
/// start from a YAML file and never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub handle: String,
    pub age: u32,
    pub location: String,
    pub occupation: String,
    pub archetype: String,
    pub personality: Personality,
    pub behavior: Behavior,
    pub registration: Registration,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Personality {
    pub traits: Vec<String>,
    pub interests: Vec<String>,
    pub writing_style: String,
    pub hot_buttons: String,
    pub social_tendencies: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Behavior {
    pub goals: Vec<String>,
    pub avoid: Vec<String>,
    #[serde(default = "default_session_minutes")]
    pub session_length_minutes: u64,
}

fn default_session_minutes() -> u64 {
    20
}

/// Facts the persona uses when a board asks it to register an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    pub email: String,
    pub real_name: String,
    pub voice_phone: String,
    pub birth_date: String,
}

/// When this persona dials in. Hours wrap past midnight when end <= start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub active_hours: Vec<ActiveWindow>,
    pub sessions_per_day: u32,
    pub min_gap_minutes: u32,
    pub jitter_minutes: u32,
    #[serde(default)]
    pub active_days: Option<Vec<u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveWindow {
    pub start: u32,
    pub end: u32,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

impl Persona {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read persona file: {}", path.display()))?;

        let mut persona: Persona = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse persona file: {}", path.display()))?;

        persona.validate()?;
        if let Some(schedule) = &mut persona.schedule {
            schedule.normalize();
        }

        Ok(persona)
    }

    fn validate(&self) -> Result<()> {
        if self.handle.trim().is_empty() {
            anyhow::bail!("Persona '{}' has an empty handle", self.name);
        }
        if let Some(schedule) = &self.schedule {
            for window in &schedule.active_hours {
                if window.start > 23 || window.end > 23 {
                    anyhow::bail!(
                        "Persona '{}' has an active_hours entry outside 0..=23",
                        self.name
                    );
                }
                if window.weight < 0.0 {
                    anyhow::bail!("Persona '{}' has a negative window weight", self.name);
                }
            }
            if let Some(days) = &schedule.active_days {
                if days.iter().any(|d| *d > 6) {
                    anyhow::bail!(
                        "Persona '{}' has an active_days entry outside 0..=6",
                        self.name
                    );
                }
            }
        }
        Ok(())
    }
}

impl Schedule {
    fn normalize(&mut self) {
        self.sessions_per_day = self.sessions_per_day.clamp(1, 10);
        self.min_gap_minutes = self.min_gap_minutes.max(5);
    }
}

/// Load every `*.yaml` persona under a directory, sorted by handle.
pub fn load_personas(dir: &Path) -> Result<Vec<Persona>> {
    let mut personas = Vec::new();

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read persona directory: {}", dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .map_or(false, |ext| ext == "yaml" || ext == "yml");
        if is_yaml {
            personas.push(Persona::load(&path)?);
        }
    }

    personas.sort_by(|a, b| a.handle.cmp(&b.handle));
    Ok(personas)
}
