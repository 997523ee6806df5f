//! Build request assembly: context, rendering and post-processing.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};

use super::{ARCHIVE_TEMPLATE, BARE_TEMPLATE, RenderError, render_str, render_value, to_text};
use crate::archive::Archive;
use crate::artifacts::ArtifactHandle;
use crate::resolve::{ResolvedSpec, deep_merge};

/// Values only known once the build of a node is about to start.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
  pub archive: Option<Archive>,
  /// Artifact of the base image; `None` for root images.
  pub base_artifact: Option<ArtifactHandle>,
  /// Gzipped user data written for this build.
  pub user_data_file: Option<PathBuf>,
}

/// A fully rendered builder document for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildRequest {
  pub node: String,
  pub version: String,
  pub artifact_name: String,
  pub document: Value,
}

impl BuildRequest {
  /// The source image the first builder starts from, if any.
  pub fn source_image(&self) -> Option<&str> {
    self
      .document
      .get("builders")?
      .as_array()?
      .iter()
      .find_map(|b| b.get("source_ami")?.as_str())
  }

  /// The document as the builder reads it.
  pub fn to_json(&self) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&self.document)
  }
}

/// The variables visible to templates.
pub fn context(spec: &ResolvedSpec, runtime: &RuntimeContext) -> Result<Value, RenderError> {
  let mut ctx = json!({
    "name": spec.name,
    "version": spec.version,
    "artifact_name": spec.artifact_name(),
    "environment": spec.environment,
    "region": spec.region,
    "instance_type": spec.instance_type,
    "base": spec.base,
    "provision": spec.provision,
    "builder_opts": spec.builder_opts,
    "metadata": spec.metadata,
    "user_data": spec.user_data(),
    "user_data_file": runtime.user_data_file,
    "archive": runtime.archive,
    "commit": runtime.archive.as_ref().and_then(|a| a.commit.clone()),
    "base_artifact": runtime.base_artifact,
  });

  let description = render_str(&spec.description, &ctx).map_err(|e| e.at("description"))?;
  ctx["description"] = Value::String(to_text(&description));
  Ok(ctx)
}

/// Read the image's builder template, or pick a built-in one.
pub fn load_template(spec: &ResolvedSpec, base_dir: &Path) -> Result<Value, RenderError> {
  let Some(template) = &spec.template else {
    let source = if spec.archive.is_some() {
      ARCHIVE_TEMPLATE
    } else {
      BARE_TEMPLATE
    };
    return serde_yaml::from_str(source).map_err(|e| RenderError::TemplateParse {
      path: PathBuf::from("<built-in>"),
      message: e.to_string(),
    });
  };

  let path = base_dir.join(template);
  let content = std::fs::read_to_string(&path).map_err(|e| RenderError::TemplateRead {
    path: path.clone(),
    message: e.to_string(),
  })?;
  serde_yaml::from_str(&content).map_err(|e| RenderError::TemplateParse {
    path,
    message: e.to_string(),
  })
}

/// Render `template` for `spec` and assemble the build request.
///
/// After rendering, `builder_opts` are merged into every builder, and a
/// builder with a `source_ami` loses its `source_ami_filter`.
pub fn render(spec: &ResolvedSpec, runtime: &RuntimeContext, template: &Value) -> Result<BuildRequest, RenderError> {
  let ctx = context(spec, runtime)?;
  let mut document = render_value(template, &ctx)?;

  let builders = document
    .get_mut("builders")
    .and_then(Value::as_array_mut)
    .filter(|b| !b.is_empty())
    .ok_or(RenderError::MissingBuilders)?;

  for builder in builders.iter_mut() {
    let merged = deep_merge(builder.take(), Value::Object(spec.builder_opts.clone()))
      .map_err(|conflict| RenderError::BuilderOpts(conflict.key))?;
    *builder = merged;

    if let Some(fields) = builder.as_object_mut()
      && fields.get("source_ami").and_then(Value::as_str).is_some_and(|s| !s.is_empty())
    {
      fields.remove("source_ami_filter");
    }
  }

  Ok(BuildRequest {
    node: spec.name.clone(),
    version: spec.version.clone(),
    artifact_name: spec.artifact_name(),
    document,
  })
}
