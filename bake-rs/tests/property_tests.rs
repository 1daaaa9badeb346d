use std::collections::HashMap;

use proptest::prelude::*;

use bake::script::expand::{expand, ExpandError, Resolve};
use bake::script::lexer::{escape, join, split, unescape};
use bake::script::parser::parse_section;

struct Vars(HashMap<String, String>);

impl Resolve for Vars {
    fn var(&self, name: &str) -> Option<String> {
        self.0.get(&name.to_lowercase()).cloned()
    }
}

fn vars(pairs: &[(&str, &str)]) -> Vars {
    Vars(pairs.iter().map(|(k, v)| (k.to_lowercase(), (*v).to_owned())).collect())
}

proptest! {
    /// Joining arguments and splitting the result gives the arguments back.
    #[test]
    fn split_join_round_trip(args in prop::collection::vec("[A-Za-z0-9 %#.,_-]{0,12}", 1..6)) {
        let line = join(&args);
        let tokens = split(&line).unwrap();
        let texts: Vec<String> = tokens.into_iter().map(|t| t.text).collect();
        prop_assert_eq!(texts, args);
    }

    /// Once expanded, expanding again changes nothing.
    #[test]
    fn expand_is_idempotent(
        s in "[A-Za-z %]{0,30}",
        a in "[A-Za-z ]{0,8}",
        b in "[A-Za-z ]{0,8}",
    ) {
        // A refers to B; B is a plain value.
        let a = format!("{a}%B%");
        let r = vars(&[("A", a.as_str()), ("B", b.as_str())]);
        if let Ok(once) = expand(&s, &r) {
            prop_assert_eq!(expand(&once, &r).unwrap(), once);
        }
    }

    /// Self-reference, direct or through another name, ends in a cycle error.
    #[test]
    fn cycles_terminate(name in "[A-Za-z][A-Za-z0-9_]{0,8}", other in "[A-Za-z][A-Za-z0-9_]{0,8}", pad in "[a-z ]{0,5}") {
        prop_assume!(!name.eq_ignore_ascii_case(&other));
        let self_ref = format!("{pad}%{name}%");
        let direct = vars(&[(name.as_str(), self_ref.as_str())]);
        let is_cycle = matches!(expand(&format!("%{name}%"), &direct), Err(ExpandError::Cycle { .. }));
        prop_assert!(is_cycle);

        let to_other = format!("%{other}%");
        let via = vars(&[(name.as_str(), to_other.as_str()), (other.as_str(), self_ref.as_str())]);
        let is_cycle = matches!(expand(&format!("x%{name}%"), &via), Err(ExpandError::Cycle { .. }));
        prop_assert!(is_cycle);
    }

    /// Escaping then unescaping restores the input.
    #[test]
    fn escape_round_trip(s in "\\PC*") {
        prop_assert_eq!(unescape(&escape(&s, true)), s.clone());
        prop_assert_eq!(unescape(&escape(&s, false)), s);
    }

    /// The parser never panics, whatever the section holds.
    #[test]
    fn parser_does_not_panic(lines in prop::collection::vec("\\PC*", 0..8), optimize in any::<bool>()) {
        let _ = parse_section(&lines, 0, 1, optimize);
    }

    /// Neither does the splitter.
    #[test]
    fn split_does_not_panic(s in "\\PC*") {
        let _ = split(&s);
    }
}

#[test]
fn undefined_names_expand_to_empty() {
    let r = vars(&[("Known", "k")]);
    assert_eq!(expand("[%Known%][%Unknown%]", &r).unwrap(), "[k][]");
}
