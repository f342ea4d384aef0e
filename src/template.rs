use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{OrchestratorError, Result};

/// A bundled template and the variables its body consumes.
pub struct TemplateDef {
    pub name: &'static str,
    pub body: &'static str,
    pub required: &'static [&'static str],
}

/// Build-time template catalog. Bodies are embedded so rendering never
/// depends on filesystem layout.
pub static CATALOG: &[TemplateDef] = &[
    TemplateDef {
        name: "kind-config.yaml",
        body: include_str!("../templates/kind-config.yaml"),
        required: &["node_port", "host_port"],
    },
    TemplateDef {
        name: "namespace.yaml",
        body: include_str!("../templates/namespace.yaml"),
        required: &["namespace"],
    },
    TemplateDef {
        name: "deployment.yaml",
        body: include_str!("../templates/deployment.yaml"),
        required: &["app_name", "namespace", "image", "replicas", "container_port", "env_from"],
    },
    TemplateDef {
        name: "service-nodeport.yaml",
        body: include_str!("../templates/service-nodeport.yaml"),
        required: &["app_name", "namespace", "port", "container_port", "node_port"],
    },
    TemplateDef {
        name: "service-clusterip.yaml",
        body: include_str!("../templates/service-clusterip.yaml"),
        required: &["app_name", "namespace", "port", "container_port"],
    },
    TemplateDef {
        name: "ingress.yaml",
        body: include_str!("../templates/ingress.yaml"),
        required: &["app_name", "namespace", "host", "port"],
    },
    TemplateDef {
        name: "secret.yaml",
        body: include_str!("../templates/secret.yaml"),
        required: &["app_name", "namespace", "data_entries"],
    },
    TemplateDef {
        name: "ingress-values.yaml",
        body: include_str!("../templates/ingress-values.yaml"),
        required: &["controller_replicas"],
    },
    TemplateDef {
        name: "ec2.tf",
        body: include_str!("../templates/ec2.tf"),
        required: &["deployment_id"],
    },
    TemplateDef {
        name: "eks-cluster.tf",
        body: include_str!("../templates/eks-cluster.tf"),
        required: &["deployment_id"],
    },
    TemplateDef {
        name: "eks-dns.tf",
        body: include_str!("../templates/eks-dns.tf"),
        required: &["deployment_id"],
    },
];

fn find(name: &str) -> Result<&'static TemplateDef> {
    CATALOG
        .iter()
        .find(|def| def.name == name)
        .ok_or_else(|| OrchestratorError::Template(format!("unknown template '{name}'")))
}

/// Substitute a flat variable bag into a named template. Missing variables
/// fail fast, listed together; extra variables are ignored.
pub fn render(name: &str, vars: &BTreeMap<String, String>) -> Result<String> {
    let def = find(name)?;
    let wanted = placeholders(def.body);

    let missing: Vec<&str> = wanted
        .iter()
        .filter(|key| !vars.contains_key(**key))
        .copied()
        .collect();
    if !missing.is_empty() {
        return Err(OrchestratorError::Template(format!(
            "template '{name}' missing variables: {}",
            missing.join(", ")
        )));
    }

    let mut out = def.body.to_string();
    for key in &wanted {
        let value = &vars[*key];
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    Ok(out)
}

pub fn render_to_file(name: &str, vars: &BTreeMap<String, String>, path: &Path) -> Result<PathBuf> {
    let rendered = render(name, vars)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, rendered)?;
    Ok(path.to_path_buf())
}

/// Startup self-check: every template's declared variable set must exactly
/// cover the placeholders in its body.
pub fn verify_catalog() -> Result<()> {
    for def in CATALOG {
        let found = placeholders(def.body);
        let declared: BTreeSet<&str> = def.required.iter().copied().collect();
        if found != declared {
            let missing: Vec<&str> = declared.difference(&found).copied().collect();
            let undeclared: Vec<&str> = found.difference(&declared).copied().collect();
            return Err(OrchestratorError::Template(format!(
                "template '{}' variable mismatch (declared-but-unused: [{}], undeclared: [{}])",
                def.name,
                missing.join(", "),
                undeclared.join(", ")
            )));
        }
    }
    Ok(())
}

fn placeholders(body: &'static str) -> BTreeSet<&'static str> {
    let mut found = BTreeSet::new();
    let mut rest = body;
    while let Some(start) = rest.find("{{") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find("}}") else { break };
        let name = &rest[..end];
        if !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            found.insert(name);
        }
        rest = &rest[end + 2..];
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn catalog_is_internally_consistent() {
        verify_catalog().expect("catalog verifies");
    }

    #[test]
    fn renders_namespace_manifest() {
        let rendered = render("namespace.yaml", &vars(&[("namespace", "demo")])).unwrap();
        assert!(rendered.contains("name: demo"));
        assert!(!rendered.contains("{{"));
    }

    #[test]
    fn missing_variables_are_listed_together() {
        let err = render("service-nodeport.yaml", &vars(&[("app_name", "x")])).unwrap_err();
        let text = format!("{err}");
        assert!(text.contains("container_port"));
        assert!(text.contains("namespace"));
        assert!(text.contains("node_port"));
        assert!(text.contains("port"));
    }

    #[test]
    fn unknown_template_is_rejected() {
        let err = render("nope.yaml", &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), "TemplateError");
    }

    #[test]
    fn rendering_is_reproducible() {
        let v = vars(&[("deployment_id", "app-1")]);
        let first = render("ec2.tf", &v).unwrap();
        let second = render("ec2.tf", &v).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("app-1-"));
    }

    #[test]
    fn extra_variables_are_ignored() {
        let rendered = render(
            "namespace.yaml",
            &vars(&[("namespace", "demo"), ("unused", "zzz")]),
        )
        .unwrap();
        assert!(rendered.contains("demo"));
        assert!(!rendered.contains("zzz"));
    }
}
