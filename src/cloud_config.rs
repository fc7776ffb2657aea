use serde::Serialize;

use crate::runner::Runner;

/// cloud-init user-data rendered for a freshly created VM: a single script
/// that installs and registers the runner, then runs it.
#[derive(Debug, Serialize)]
pub struct Data {
    pub write_files: Vec<WriteFile>,
    pub runcmd: Vec<String>,
}

impl Data {
    pub fn from_registration(runner: &Runner, token: &str, org: &str, installer: &str) -> Self {
        let template = include_str!("../scripts/start.sh");
        let content = template
            .replace("___INSTALLER_URL___", installer)
            .replace("___REGISTRATION_TOKEN___", token)
            .replace("___GITHUB_ORGANIZATION___", org)
            .replace("___RUNNER_NAME___", &runner.name)
            .replace("___RUNNER_LABELS___", &runner.vm_type.tags().join(","))
            .replace("___RUNNER_USER___", &runner.vm_type.config.runner_user)
            .replace("___RUNNER_GROUP___", &runner.vm_type.config.runner_group);

        Self {
            write_files: vec![WriteFile {
                path: "/start.sh".into(),
                permissions: "0755".into(),
                content,
            }],
            runcmd: vec!["/start.sh".into()],
        }
    }

    pub fn to_user_data(&self) -> serde_yaml::Result<String> {
        Ok(format!("#cloud-config\n{}", serde_yaml::to_string(self)?))
    }
}

#[derive(Debug, Serialize)]
pub struct WriteFile {
    pub path: String,
    pub content: String,
    pub permissions: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm_type::{CloudConfig, Quantity, VmType};

    #[test]
    fn renders_cloud_config_with_substituted_tokens() {
        let vm_type = VmType::new(
            vec!["small".into()],
            CloudConfig {
                image: "img".into(),
                flavor: "flv".into(),
                network: "net".into(),
                key_name: "key".into(),
                runner_user: "ghrunner".into(),
                runner_group: "ghrunner".into(),
            },
            Quantity { min: 1, max: 2 },
        );
        let runner = Runner::new("runner-os-acme-abc-0".into(), vm_type);

        let data =
            Data::from_registration(&runner, "tok-123", "acme", "https://dl.example/runner.tar.gz");
        let content = &data.write_files[0].content;

        assert!(content.contains("tok-123"));
        assert!(content.contains("acme"));
        assert!(content.contains("runner-os-acme-abc-0"));
        assert!(content.contains("ghrunner"));
        assert!(!content.contains("___"));

        let rendered = data.to_user_data().unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
    }
}
