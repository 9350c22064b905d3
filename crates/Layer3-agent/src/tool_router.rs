//! Tool Router - skill tools resolved into action requests
//!
//! Every tool is an invocation contract: a program, argument templates and a
//! parameter schema. Resolving a call substitutes parameters into the
//! templates one argument at a time, so a parameter value never becomes
//! interpreter syntax.
//!
//! ## Templates
//!
//! ```text
//! "{name}"          whole argument; an array value expands to several arguments
//! "--name={name}"   embedded; scalar values only
//! ```
//!
//! An argument whose placeholder refers to an absent optional parameter is
//! dropped.
//!
//! ## Skills
//!
//! `<skills_dir>/<skill>/manifest.json`:
//!
//! ```text
//! {
//!   "name": "example-skill",
//!   "version": "1.0.0",
//!   "entrypoint": { "unix": "python3 scripts/main.py", "windows": "python scripts/main.py" },
//!   "tools": [
//!     "system_info",
//!     { "name": "hello", "args": ["hello", "{name}"], "params": [{ "name": "name", "default": "World" }] }
//!   ]
//! }
//! ```

use claw_foundation::{Error, JsonStore, Result, RiskTier};
use claw_task::{ActionRequest, ExecMode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "manifest.json";

/// Program to run, either shared or per platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entrypoint {
    Command(String),
    PerPlatform {
        #[serde(default)]
        unix: Option<String>,
        #[serde(default)]
        windows: Option<String>,
    },
}

impl Entrypoint {
    /// Command line for the running platform
    pub fn current(&self) -> Option<&str> {
        match self {
            Entrypoint::Command(cmd) => Some(cmd),
            Entrypoint::PerPlatform { unix, windows } => {
                if cfg!(windows) {
                    windows.as_deref()
                } else {
                    unix.as_deref()
                }
            }
        }
    }
}

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolParam {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl ToolParam {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            required: false,
            ..Self::required(name)
        }
    }

    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// Invocation contract of one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolContract {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Program argv before the templates (already split)
    pub program: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub params: Vec<ToolParam>,
    /// Declared tier; the classifier may still raise it
    #[serde(default)]
    pub tier: RiskTier,
    #[serde(default)]
    pub mode: ExecMode,
    /// Skill that provides the tool
    #[serde(default)]
    pub skill: Option<String>,
}

impl ToolContract {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            program: vec![program.into()],
            args: Vec::new(),
            params: Vec::new(),
            tier: RiskTier::Safe,
            mode: ExecMode::Direct,
            skill: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_param(mut self, param: ToolParam) -> Self {
        self.params.push(param);
        self
    }

    pub fn with_tier(mut self, tier: RiskTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("tool name is empty".into()));
        }
        if self.program.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(Error::Config(format!("tool {} has no program", self.name)));
        }
        for template in &self.args {
            for placeholder in placeholders(template) {
                if !self.params.iter().any(|p| p.name == placeholder) {
                    return Err(Error::Config(format!(
                        "tool {} references undeclared parameter {{{}}}",
                        self.name, placeholder
                    )));
                }
            }
        }
        Ok(())
    }

    /// Bind parameters and build the request
    pub fn resolve(&self, params: &Map<String, Value>) -> Result<ActionRequest> {
        for key in params.keys() {
            if !self.params.iter().any(|p| &p.name == key) {
                return Err(Error::InvalidRequest(format!(
                    "tool {} has no parameter {}",
                    self.name, key
                )));
            }
        }

        let mut bound: HashMap<&str, Vec<String>> = HashMap::new();
        for param in &self.params {
            let values = match params.get(&param.name) {
                Some(value) => param_values(&self.name, &param.name, value)?,
                None => Vec::new(),
            };
            let values = match (values.is_empty(), &param.default) {
                (true, Some(default)) => vec![default.clone()],
                _ => values,
            };
            if values.is_empty() && param.required {
                return Err(Error::InvalidRequest(format!(
                    "tool {} requires parameter {}",
                    self.name, param.name
                )));
            }
            bound.insert(param.name.as_str(), values);
        }

        let mut argv: Vec<String> = self.program[1..].to_vec();
        for template in &self.args {
            argv.extend(expand(&self.name, template, &bound)?);
        }

        Ok(ActionRequest::new(self.program[0].clone())
            .with_args(argv)
            .with_tier(self.tier)
            .with_mode(self.mode)
            .with_tool(self.name.clone()))
    }
}

/// A model-proposed tool invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ToolCall {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            ..Default::default()
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

fn param_values(tool: &str, name: &str, value: &Value) -> Result<Vec<String>> {
    let scalar = |v: &Value| match v {
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        Value::Null => Ok(None),
        _ => Err(Error::InvalidRequest(format!(
            "parameter {} of tool {} must be a scalar or a list of scalars",
            name, tool
        ))),
    };
    match value {
        Value::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = scalar(item)? {
                    values.push(v);
                }
            }
            Ok(values)
        }
        other => Ok(scalar(other)?.into_iter().collect()),
    }
}

fn placeholders(template: &str) -> Vec<&str> {
    let mut found = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                found.push(&after[..end]);
                rest = &after[end + 1..];
            }
            None => break,
        }
    }
    found
}

fn expand(tool: &str, template: &str, bound: &HashMap<&str, Vec<String>>) -> Result<Vec<String>> {
    let names = placeholders(template);
    if names.is_empty() {
        return Ok(vec![template.to_string()]);
    }

    // whole-argument placeholder
    if names.len() == 1 && template == format!("{{{}}}", names[0]) {
        return Ok(bound.get(names[0]).cloned().unwrap_or_default());
    }

    let mut arg = template.to_string();
    for name in names {
        let values = bound.get(name).map(Vec::as_slice).unwrap_or_default();
        match values {
            [] => return Ok(Vec::new()),
            [value] => arg = arg.replace(&format!("{{{}}}", name), value),
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "parameter {} of tool {} takes a single value in {}",
                    name, tool, template
                )))
            }
        }
    }
    Ok(vec![arg])
}

// ============================================================================
// Skill manifests
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ToolEntry {
    /// Tool name passed as the first entrypoint argument
    Named(String),
    Contract(ToolManifest),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolManifest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    program: Option<Entrypoint>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    params: Vec<ToolParam>,
    #[serde(default)]
    tier: Option<RiskTier>,
    #[serde(default)]
    mode: ExecMode,
}

#[derive(Debug, Clone, Deserialize)]
struct SkillManifest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    entrypoint: Option<Entrypoint>,
    #[serde(default)]
    tools: Vec<ToolEntry>,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

/// A loaded skill
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkillInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub author: Option<String>,
    pub tools: Vec<String>,
    pub manifest_path: PathBuf,
}

/// Split a command line and anchor relative paths that exist in the skill dir
fn skill_argv(skill_dir: &Path, command: &str) -> Option<Vec<String>> {
    let argv = shlex::split(command)?;
    if argv.is_empty() {
        return None;
    }
    Some(
        argv.into_iter()
            .map(|token| {
                let candidate = skill_dir.join(&token);
                if Path::new(&token).is_relative() && candidate.is_file() {
                    candidate.display().to_string()
                } else {
                    token
                }
            })
            .collect(),
    )
}

// ============================================================================
// Registry
// ============================================================================

/// Tool name → invocation contract
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolContract>,
    skills: Vec<SkillInfo>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool of the same name
    pub fn register(&mut self, contract: ToolContract) -> Result<()> {
        contract.validate()?;
        if self.tools.contains_key(&contract.name) {
            warn!("tool {} registered twice, keeping the latest", contract.name);
        }
        self.tools.insert(contract.name.clone(), contract);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolContract> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Tool names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn skills(&self) -> &[SkillInfo] {
        &self.skills
    }

    /// Skill that provides `tool`
    pub fn skill_of(&self, tool: &str) -> Option<&SkillInfo> {
        self.skills
            .iter()
            .find(|s| s.tools.iter().any(|t| t == tool))
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Resolve a call into an action request
    pub fn resolve(&self, call: &ToolCall) -> Result<ActionRequest> {
        let contract = self
            .get(&call.tool)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown tool {}", call.tool)))?;
        let request = contract.resolve(&call.params)?;
        debug!("resolved tool {} → {}", call.tool, request.command_line());
        Ok(match &call.cwd {
            Some(cwd) => request.with_cwd(cwd),
            None => request,
        })
    }

    /// Load every `<dir>/<skill>/manifest.json`. A missing directory yields
    /// an empty registry; a broken manifest is skipped with a warning.
    pub fn load_skills(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut registry = Self::new();
        if !dir.is_dir() {
            warn!("skills directory {} does not exist", dir.display());
            return Ok(registry);
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        entries.sort();

        for skill_dir in entries {
            if let Err(e) = registry.load_skill(&skill_dir) {
                warn!("failed to load skill {}: {}", skill_dir.display(), e);
            }
        }
        info!(
            "Loaded {} skills ({} tools)",
            registry.skills.len(),
            registry.tools.len()
        );
        Ok(registry)
    }

    fn load_skill(&mut self, skill_dir: &Path) -> Result<()> {
        let store = JsonStore::new(skill_dir);
        let Some(manifest) = store.load_optional::<SkillManifest>(MANIFEST_FILE)? else {
            warn!("skill {} has no {}", skill_dir.display(), MANIFEST_FILE);
            return Ok(());
        };
        let dir_name = skill_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let skill_name = manifest.name.clone().unwrap_or(dir_name);
        let entrypoint = manifest
            .entrypoint
            .as_ref()
            .and_then(Entrypoint::current)
            .and_then(|cmd| skill_argv(skill_dir, cmd));

        let mut contracts = Vec::with_capacity(manifest.tools.len());
        for entry in &manifest.tools {
            let contract = match entry {
                ToolEntry::Named(name) => {
                    let program = entrypoint.clone().ok_or_else(|| {
                        Error::Config(format!(
                            "tool {} of skill {} needs an entrypoint for this platform",
                            name, skill_name
                        ))
                    })?;
                    ToolContract {
                        name: name.clone(),
                        description: String::new(),
                        program,
                        args: vec![name.clone()],
                        params: Vec::new(),
                        tier: RiskTier::Sensitive,
                        mode: ExecMode::Direct,
                        skill: Some(skill_name.clone()),
                    }
                }
                ToolEntry::Contract(tool) => {
                    let program = match &tool.program {
                        Some(program) => program
                            .current()
                            .and_then(|cmd| skill_argv(skill_dir, cmd)),
                        None => entrypoint.clone(),
                    }
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "tool {} of skill {} has no program for this platform",
                            tool.name, skill_name
                        ))
                    })?;
                    ToolContract {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        program,
                        args: tool.args.clone(),
                        params: tool.params.clone(),
                        // skill code is third party
                        tier: tool.tier.unwrap_or(RiskTier::Sensitive),
                        mode: tool.mode,
                        skill: Some(skill_name.clone()),
                    }
                }
            };
            contract.validate()?;
            contracts.push(contract);
        }

        let tools: Vec<String> = contracts.iter().map(|c| c.name.clone()).collect();
        for contract in contracts {
            self.register(contract)?;
        }
        info!("Loaded skill: {} v{}", skill_name, manifest.version);
        self.skills.push(SkillInfo {
            name: skill_name,
            version: manifest.version,
            description: manifest.description,
            author: manifest.author,
            tools,
            manifest_path: store.file_path(MANIFEST_FILE),
        });
        Ok(())
    }
}
