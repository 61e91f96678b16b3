pub const DEFAULT_COMMAND_TEMPLATE: &str =
    r#"python train.py --subclass "{subclass}" --dataset "{dataset_path}" --output runs/{slug}"#;

const PLACEHOLDERS: [&str; 3] = ["{subclass}", "{dataset_path}", "{slug}"];

/// Lowercased subclass with whitespace runs collapsed to `-`.
#[must_use]
pub fn slug(subclass: &str) -> String {
    subclass
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
}

/// Substitute placeholders in a single pass, so values are never re-expanded.
/// Unknown `{...}` sequences are left as written.
#[must_use]
pub fn render_command(template: &str, subclass: &str, dataset_path: &str) -> String {
    let slug = slug(subclass);
    let values = [subclass, dataset_path, slug.as_str()];

    let mut out = String::with_capacity(template.len() + subclass.len() + dataset_path.len());
    let mut rest = template;
    'scan: while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        rest = &rest[start..];
        for (placeholder, value) in PLACEHOLDERS.iter().zip(values) {
            if let Some(after) = rest.strip_prefix(placeholder) {
                out.push_str(value);
                rest = after;
                continue 'scan;
            }
        }
        out.push('{');
        rest = &rest[1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_whitespace() {
        assert_eq!(slug("Golden  Retriever"), "golden-retriever");
        assert_eq!(slug(" Tabby\tCat "), "tabby-cat");
        assert_eq!(slug("dog"), "dog");
    }

    #[test]
    fn default_template_renders() {
        let cmd = render_command(DEFAULT_COMMAND_TEMPLATE, "Maine Coon", "/data/cats");
        assert_eq!(
            cmd,
            r#"python train.py --subclass "Maine Coon" --dataset "/data/cats" --output runs/maine-coon"#
        );
    }

    #[test]
    fn repeated_and_unknown_placeholders() {
        let cmd = render_command("{slug}/{slug} {epochs} {", "A B", "/d");
        assert_eq!(cmd, "a-b/a-b {epochs} {");
    }

    #[test]
    fn values_are_not_reexpanded() {
        let cmd = render_command("{subclass} {dataset_path}", "{dataset_path}", "/d");
        assert_eq!(cmd, "{dataset_path} /d");
    }
}
