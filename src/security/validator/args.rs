use super::patterns::SHELL_METACHARACTERS;
use super::{InputValidator, ValidationResult};
use crate::security::events::{EventKind, Severity};

impl InputValidator {
    /// Validate an argument vector before it is handed to a subprocess.
    ///
    /// Shell metacharacters are rejected outright. Path-like arguments,
    /// including the value half of `--flag=value`, must pass
    /// [`InputValidator::validate_file_path`]. Accepted arguments are
    /// returned unchanged.
    pub fn validate_cli_args(&self, args: &[String]) -> ValidationResult<Vec<String>> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for (i, arg) in args.iter().enumerate() {
            if arg
                .chars()
                .any(|c| SHELL_METACHARACTERS.contains(&c) || c == '\n' || c == '\r' || c == '\0')
            {
                let message = format!("Argument {}: shell metacharacters are not allowed", i);
                self.report(EventKind::ShellInjection, Severity::High, arg, &message);
                errors.push(message);
                continue;
            }

            if let Some(candidate) = path_candidate(arg) {
                let result = self.validate_file_path(candidate);
                errors.extend(
                    result
                        .errors()
                        .iter()
                        .map(|e| format!("Argument {}: {}", i, e)),
                );
                warnings.extend(
                    result
                        .warnings()
                        .iter()
                        .map(|w| format!("Argument {}: {}", i, w)),
                );
            }
        }

        ValidationResult::new(args.to_vec(), errors, warnings)
    }
}

/// The part of an argument that names a file, if it looks like one.
fn path_candidate(arg: &str) -> Option<&str> {
    let value = if arg.starts_with('-') {
        arg.split_once('=').map(|(_, v)| v)?
    } else {
        arg
    };
    let looks_like_path = value.contains('/')
        || value.contains('\\')
        || value.contains('%')
        || value.starts_with('~')
        || value.starts_with('.');
    (looks_like_path && !value.is_empty()).then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::validator::test_validator;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn safe_args_pass_through() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let input = args(&["build", "--format=html", "--out=site/docs", "docs/index.md", "-v"]);
        let result = v.validate_cli_args(&input);
        assert!(result.is_valid(), "{:?}", result.errors());
        assert_eq!(result.sanitized_value().unwrap(), &input);
    }

    #[test]
    fn metacharacters_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());
        let result = v.validate_cli_args(&args(&["ok", "a; rm -rf /", "$(id)", "x\ny"]));
        assert!(!result.is_valid());
        assert_eq!(
            result.errors(),
            &[
                "Argument 1: shell metacharacters are not allowed".to_string(),
                "Argument 2: shell metacharacters are not allowed".to_string(),
                "Argument 3: shell metacharacters are not allowed".to_string(),
            ]
        );
        assert_eq!(v.auditor().trail().of_kind(EventKind::ShellInjection).len(), 3);
    }

    #[test]
    fn path_like_args_are_checked() {
        let tmp = tempfile::tempdir().unwrap();
        let v = test_validator(tmp.path());

        let flag = v.validate_cli_args(&args(&["--input=../../etc/passwd"]));
        assert!(!flag.is_valid());
        assert!(flag.errors()[0].starts_with("Argument 0: Path traversal attempt detected"));

        let positional = v.validate_cli_args(&args(&["render", "~/secrets.md"]));
        assert!(!positional.is_valid());
        assert!(positional.errors()[0].starts_with("Argument 1:"));
    }

    #[test]
    fn candidate_detection() {
        assert_eq!(path_candidate("--out=a/b"), Some("a/b"));
        assert_eq!(path_candidate("--verbose"), None);
        assert_eq!(path_candidate("--name=plain"), None);
        assert_eq!(path_candidate("./x"), Some("./x"));
        assert_eq!(path_candidate("word"), None);
    }
}
