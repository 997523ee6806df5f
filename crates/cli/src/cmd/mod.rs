mod build;
mod list;
mod plan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use shelver_lib::registry::Registry;
use shelver_lib::workspace::Workspace;

pub use build::{BuildArgs, cmd_build};
pub use list::cmd_list;
pub use plan::cmd_plan;

/// Options shared by every command.
pub struct Global {
  pub config: PathBuf,
  pub base_dir: Option<PathBuf>,
  pub cache_dir: Option<PathBuf>,
  pub tmp_dir: Option<PathBuf>,
  pub log_dir: Option<PathBuf>,
  pub keep_tmp: bool,
  pub builder_cmd: String,
}

impl Global {
  pub fn load_registry(&self) -> Result<Registry> {
    Registry::load(&self.config).with_context(|| format!("Failed to load registry: {}", self.config.display()))
  }

  /// The workspace, rooted at `--base-dir` or the registry's directory.
  pub fn workspace(&self) -> Result<Workspace> {
    let base_dir = match &self.base_dir {
      Some(dir) => dir.clone(),
      None => match self.config.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
      },
    };
    let base_dir = absolute(&base_dir)?;

    let mut workspace = Workspace::new(base_dir).keep_tmp(self.keep_tmp);
    if let Some(dir) = &self.cache_dir {
      workspace = workspace.with_cache_dir(absolute(dir)?);
    }
    if let Some(dir) = &self.tmp_dir {
      workspace = workspace.with_tmp_dir(absolute(dir)?);
    }
    if let Some(dir) = &self.log_dir {
      workspace = workspace.with_log_dir(absolute(dir)?);
    }
    Ok(workspace)
  }

  /// The builder command split into program and arguments.
  pub fn builder_command(&self) -> Result<Vec<String>> {
    let command: Vec<String> = self.builder_cmd.split_whitespace().map(str::to_string).collect();
    if command.is_empty() {
      bail!("--builder-cmd must not be empty");
    }
    Ok(command)
  }
}

fn absolute(path: &Path) -> Result<PathBuf> {
  if path.is_absolute() {
    return Ok(path.to_path_buf());
  }
  let cwd = std::env::current_dir().context("Failed to read current directory")?;
  Ok(dunce::simplified(&cwd.join(path)).to_path_buf())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn global(config: &str) -> Global {
    Global {
      config: PathBuf::from(config),
      base_dir: None,
      cache_dir: None,
      tmp_dir: None,
      log_dir: None,
      keep_tmp: false,
      builder_cmd: "packer".to_string(),
    }
  }

  #[test]
  fn base_dir_defaults_to_registry_directory() {
    let workspace = global("/srv/images/shelver.yml").workspace().unwrap();
    assert_eq!(workspace.base_dir, PathBuf::from("/srv/images"));
    assert_eq!(workspace.cache_dir, PathBuf::from("/srv/images/.shelver/cache"));
  }

  #[test]
  fn bare_registry_name_uses_current_directory() {
    let workspace = global("shelver.yml").workspace().unwrap();
    assert!(workspace.base_dir.is_absolute());
  }

  #[test]
  fn directory_overrides_apply() {
    let mut global = global("/srv/images/shelver.yml");
    global.cache_dir = Some(PathBuf::from("/var/cache/shelver"));
    global.keep_tmp = true;
    let workspace = global.workspace().unwrap();
    assert_eq!(workspace.cache_dir, PathBuf::from("/var/cache/shelver"));
    assert_eq!(workspace.log_dir, PathBuf::from("/srv/images/.shelver/log"));
    assert!(workspace.keep_tmp);
  }

  #[test]
  fn builder_command_split() {
    let mut global = global("shelver.yml");
    global.builder_cmd = "docker run packer".to_string();
    assert_eq!(global.builder_command().unwrap(), vec!["docker", "run", "packer"]);

    global.builder_cmd = "  ".to_string();
    assert!(global.builder_command().is_err());
  }
}
