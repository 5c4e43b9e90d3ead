use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment variable the generated image reads its listening port from.
/// The runtime overrides it per deployment, so templates must never hard-code
/// the port into commands.
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectFamily {
    Node,
    Python,
}

impl ProjectFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectFamily::Node => "node",
            ProjectFamily::Python => "python",
        }
    }
}

/// Per-family containerization template: base image plus the install and
/// start steps. Adding a project family means appending a row to
/// [`DETECTION_TABLE`] and a template here, under test coverage.
struct Template {
    base_image: &'static str,
    manifest_copy: &'static str,
    install: &'static str,
    start: &'static str,
}

const fn template_for(family: ProjectFamily) -> Template {
    match family {
        ProjectFamily::Node => Template {
            base_image: "node:18-alpine",
            manifest_copy: "COPY package*.json ./",
            install: "RUN npm install",
            start: "npm start -- --port ${PORT}",
        },
        ProjectFamily::Python => Template {
            base_image: "python:3.11-slim",
            manifest_copy: "COPY requirements.txt .",
            install: "RUN pip install -r requirements.txt",
            start: "python app.py --port ${PORT}",
        },
    }
}

/// Ordered marker-file detection table; the first match wins. A project with
/// no marker is an error, never a default.
const DETECTION_TABLE: &[(&str, ProjectFamily)] = &[
    ("package.json", ProjectFamily::Node),
    ("requirements.txt", ProjectFamily::Python),
];

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("unsupported project type: no recognized marker file in {0}")]
    UnsupportedProjectType(PathBuf),
    #[error("failed to write build recipe: {0}")]
    Io(#[from] std::io::Error),
}

/// Inferred containerization recipe for a project directory. Ephemeral and
/// fully determined by the project contents plus the configured default port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildDescriptor {
    pub family: ProjectFamily,
    pub base_image: &'static str,
    /// Port the container process listens on unless the runtime overrides
    /// [`PORT_ENV`].
    pub default_port: u16,
    dockerfile: String,
}

impl BuildDescriptor {
    pub fn dockerfile(&self) -> &str {
        &self.dockerfile
    }

    /// Write the recipe into the project directory for the image build.
    pub fn write_to(&self, project_dir: &Path) -> Result<PathBuf, DescriptorError> {
        let path = project_dir.join("Dockerfile");
        fs::write(&path, &self.dockerfile)?;
        Ok(path)
    }
}

/// Inspect `project_dir` and infer how to containerize it.
pub fn infer(project_dir: &Path, default_port: u16) -> Result<BuildDescriptor, DescriptorError> {
    let family = DETECTION_TABLE
        .iter()
        .find(|(marker, _)| project_dir.join(marker).is_file())
        .map(|(_, family)| *family)
        .ok_or_else(|| DescriptorError::UnsupportedProjectType(project_dir.to_path_buf()))?;

    let template = template_for(family);
    Ok(BuildDescriptor {
        family,
        base_image: template.base_image,
        default_port,
        dockerfile: render_dockerfile(&template, default_port),
    })
}

fn render_dockerfile(template: &Template, default_port: u16) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "FROM {}", template.base_image);
    let _ = writeln!(out, "WORKDIR /app");
    let _ = writeln!(out, "{}", template.manifest_copy);
    let _ = writeln!(out, "{}", template.install);
    let _ = writeln!(out, "COPY . .");
    let _ = writeln!(out, "ENV {PORT_ENV}={default_port}");
    let _ = writeln!(out, "EXPOSE ${{{PORT_ENV}}}");
    let _ = writeln!(out, "CMD [\"sh\", \"-c\", \"{}\"]", template.start);
    out
}
