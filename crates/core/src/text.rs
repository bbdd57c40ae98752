//! One-line output formatting: bracketed status lines and prefixed log lines,
//! each wrapped in a 256-color escape picked from the line's context name.

use crate::StatusTriple;

/// Color key shared by every pod log and port-forward line.
pub const PODS: &str = "pods";

/// Wrap `text` in the 256-color escape for `name`.
pub fn color(name: &str, text: &str) -> String {
    format!("\x1b[38;5;{}m{}\x1b[0m", color_code(name), text)
}

/// Deterministic palette index in the 6x6x6 cube (16..=231).
pub fn color_code(name: &str) -> u8 {
    let sum = name.chars().fold(0u32, |acc, c| acc.wrapping_add(c as u32));
    16 + (sum % 216) as u8
}

/// `prefix + text + suffix`, or nothing when `text` is empty.
pub fn delim(text: &str, prefix: &str, suffix: &str) -> String {
    if text.is_empty() { String::new() } else { format!("{prefix}{text}{suffix}") }
}

/// Space-join the non-empty parts.
pub fn join<S: AsRef<str>>(parts: &[S]) -> String {
    parts
        .iter()
        .map(AsRef::as_ref)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// `[<resource>/<name>] (<phase>) <reason>: <message>` with empty parts elided.
pub fn status_line(resource: &str, name: &str, st: &StatusTriple) -> String {
    let text = join(&[
        delim(&format!("{resource}/{name}"), "[", "]"),
        delim(&st.phase, "(", ")"),
        delim(&st.reason, "", ":"),
        st.message.clone(),
    ]);
    color(resource, &text)
}

pub fn log_prefix(pod: &str, container: &str) -> String {
    format!("[pods/{pod}] {container}:  ")
}

pub fn log_line(prefix: &str, line: &str) -> String {
    color(PODS, &format!("{prefix}{line}"))
}

/// A supervisor notice about one container, e.g. a port forward coming up.
pub fn pod_notice(pod: &str, container: &str, message: &str) -> String {
    color(PODS, &format!("[pods/{pod}/{container}] {message}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_code_is_stable_and_in_cube() {
        assert_eq!(color_code("pods"), color_code("pods"));
        // p(112) + o(111) + d(100) + s(115) = 438 -> 438 % 216 = 6
        assert_eq!(color_code("pods"), 22);
        assert_eq!(color_code(""), 16);
        for name in ["deployments", "services", "ingresses", "x"] {
            assert!((16..=231).contains(&color_code(name)));
        }
    }

    #[test]
    fn status_line_elides_empty_parts() {
        let st = StatusTriple::new("Pending", "", "ready replicas 0 does not match replicas 1");
        let line = status_line("deployments", "web", &st);
        assert_eq!(line, color("deployments", "[deployments/web] (Pending) ready replicas 0 does not match replicas 1"));

        let st = StatusTriple::new("Waiting", "ErrImagePull", "nope");
        assert_eq!(status_line("pods", "p", &st), color("pods", "[pods/p] (Waiting) ErrImagePull: nope"));

        assert_eq!(status_line("pods", "p", &StatusTriple::default()), color("pods", "[pods/p]"));
    }

    #[test]
    fn log_line_layout() {
        let prefix = log_prefix("web-1", "nginx");
        assert_eq!(log_line(&prefix, "GET /"), "\x1b[38;5;22m[pods/web-1] nginx:  GET /\x1b[0m");
    }

    #[test]
    fn delim_and_join() {
        assert_eq!(delim("", "[", "]"), "");
        assert_eq!(delim("a", "[", "]"), "[a]");
        assert_eq!(join(&["a", "", "b", ""]), "a b");
    }
}
