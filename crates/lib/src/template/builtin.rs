//! Built-in builder templates, used when an image sets no `template`.

/// Template for images with a provisioning archive: an `amazon-ebs` builder,
/// an upload of the archive, and a shell step running the playbook.
pub const ARCHIVE_TEMPLATE: &str = r#"
builders:
  - type: amazon-ebs
    region: "{{ region }}"
    instance_type: "{{ instance_type }}"
    ami_name: "{{ artifact_name }}"
    ami_description: "{{ description }}"
    source_ami: "{{ base_artifact.id }}"
    source_ami_filter:
      filters:
        virtualization-type: hvm
        name: "ubuntu/images/*ubuntu-xenial-16.04-amd64-server-*"
        root-device-type: ebs
      owners: ["099720109477"]
      most_recent: true
    ssh_username: ubuntu
    user_data_file: "{{ user_data_file | default('') }}"
    tags:
      ImageName: "{{ name }}"
      ImageVersion: "{{ version }}"
      ImageEnvironment: "{{ environment }}"

provisioners:
  - type: file
    source: "{{ archive.path }}"
    destination: /tmp/provision.tar.gz
  - type: shell
    inline:
      - "mkdir -p /tmp/provision && tar -xzf /tmp/provision.tar.gz -C /tmp/provision"
      - "cd /tmp/provision && sudo ./provision.sh {{ provision.playbook | default('site.yml') | quote }} {{ provision.groups | join(',') | quote }} {{ environment | quote }} '{% if provision.bootstrap %}bootstrap{% else %}no-bootstrap{% endif %}'"
"#;

/// Template for images without an archive: the builder alone.
pub const BARE_TEMPLATE: &str = r#"
builders:
  - type: amazon-ebs
    region: "{{ region }}"
    instance_type: "{{ instance_type }}"
    ami_name: "{{ artifact_name }}"
    ami_description: "{{ description }}"
    source_ami: "{{ base_artifact.id }}"
    source_ami_filter:
      filters:
        virtualization-type: hvm
        name: "ubuntu/images/*ubuntu-xenial-16.04-amd64-server-*"
        root-device-type: ebs
      owners: ["099720109477"]
      most_recent: true
    ssh_username: ubuntu
    user_data_file: "{{ user_data_file | default('') }}"
    tags:
      ImageName: "{{ name }}"
      ImageVersion: "{{ version }}"
      ImageEnvironment: "{{ environment }}"
"#;
