//! Machine-readable builder output.
//!
//! Each line is `timestamp,target,type,data...`. Commas inside data fields
//! are escaped as `%!(PACKER_COMMA)` and newlines as a literal `\n`.
//!
//! ```text
//! 1700000000,,ui,say,==> amazon-ebs: Creating temporary keypair
//! 1700000000,amazon-ebs,artifact,0,id,us-east-1:ami-0abc
//! 1700000000,,error,Build 'amazon-ebs' errored
//! ```

use std::collections::BTreeMap;

use crate::artifacts::ArtifactHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineLine {
  pub timestamp: u64,
  pub target: String,
  pub message: MachineMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineMessage {
  /// Human oriented output (`say`, `message`, `error` levels).
  Ui { level: String, text: String },
  Error(String),
  Artifact {
    index: usize,
    key: String,
    values: Vec<String>,
  },
  /// Any other message type.
  Other { kind: String, data: Vec<String> },
}

fn unescape(field: &str) -> String {
  field.replace("%!(PACKER_COMMA)", ",").replace("\\n", "\n")
}

/// Parse one line. Returns `None` for lines that are not machine-readable.
pub fn parse_line(line: &str) -> Option<MachineLine> {
  let mut fields = line.trim_end_matches(['\r', '\n']).split(',');
  let timestamp = fields.next()?.parse::<u64>().ok()?;
  let target = unescape(fields.next()?);
  let kind = fields.next()?.to_string();
  let data: Vec<String> = fields.map(unescape).collect();

  let message = match kind.as_str() {
    "ui" => {
      let (level, rest) = data.split_first()?;
      MachineMessage::Ui {
        level: level.clone(),
        text: rest.join(","),
      }
    }
    "error" => MachineMessage::Error(data.join(",")),
    "artifact" if data.len() >= 2 => MachineMessage::Artifact {
      index: data[0].parse().ok()?,
      key: data[1].clone(),
      values: data[2..].to_vec(),
    },
    _ => MachineMessage::Other { kind, data },
  };

  Some(MachineLine {
    timestamp,
    target,
    message,
  })
}

/// Artifact fields reported for one artifact index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactFields {
  pub builder_id: Option<String>,
  pub id: Option<String>,
}

/// What a builder run reported, accumulated line by line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineOutput {
  pub errors: Vec<String>,
  pub artifacts: BTreeMap<usize, ArtifactFields>,
}

impl MachineOutput {
  pub fn record(&mut self, line: &MachineLine) {
    match &line.message {
      MachineMessage::Error(text) => self.errors.push(text.clone()),
      MachineMessage::Ui { level, text } if level == "error" => self.errors.push(text.clone()),
      MachineMessage::Artifact { index, key, values } => {
        let fields = self.artifacts.entry(*index).or_default();
        let value = values.join(",");
        match key.as_str() {
          "id" => fields.id = Some(value),
          "builder-id" => fields.builder_id = Some(value),
          _ => {}
        }
      }
      _ => {}
    }
  }

  /// The first reported artifact id, split into region and image id.
  ///
  /// Multi-region ids (`r1:ami-1,r2:ami-2`) yield the first pair.
  pub fn artifact(&self, node: &str) -> Option<ArtifactHandle> {
    let raw = self.artifacts.values().find_map(|a| a.id.as_deref())?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() {
      return None;
    }

    let (region, id) = match first.split_once(':') {
      Some((region, id)) if !id.is_empty() => (Some(region.to_string()), id.to_string()),
      _ => (None, first.to_string()),
    };
    Some(ArtifactHandle {
      node: node.to_string(),
      id,
      region,
    })
  }
}
