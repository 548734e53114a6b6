//! Static analysis of submitted server source.
//!
//! The source is parsed with tree-sitter and every node is checked against
//! the import, call and attribute policy in [`super::policy`]. The walk never
//! fails: a source that does not parse yields a single `Syntax` violation with
//! an unknown location.

use super::policy::{
    self, ModuleVerdict, DYNAMIC_EVAL_CALLS, DYNAMIC_EVAL_METHODS, INTROSPECTION_ATTRS,
    NAME_GETTER_CALLS, REFLECTIVE_CALLS,
};
use kiln_shared::{Capabilities, Location, ValidationResult, Violation, ViolationRule};
use tree_sitter::{Node, Parser};

/// Names that are flagged even when merely referenced (e.g. `f = eval`).
const EVAL_REFERENCES: &[&str] = &["eval", "exec", "__import__"];

#[derive(Debug, Clone)]
pub struct CodeValidator {
    max_code_bytes: usize,
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self::new(65_536)
    }
}

impl CodeValidator {
    #[must_use]
    pub fn new(max_code_bytes: usize) -> Self {
        Self { max_code_bytes }
    }

    pub fn validate(&self, source: &str, caps: Capabilities) -> ValidationResult {
        if source.len() > self.max_code_bytes {
            return ValidationResult::Invalid(vec![Violation::new(
                ViolationRule::SourceTooLarge,
                format!(
                    "source is {} bytes, the limit is {} bytes",
                    source.len(),
                    self.max_code_bytes
                ),
                Location::Unknown,
            )]);
        }

        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            return syntax_failure(format!("python grammar unavailable: {e}"));
        }
        let Some(tree) = parser.parse(source, None) else {
            return syntax_failure("source could not be parsed".to_string());
        };
        let root = tree.root_node();
        if root.has_error() {
            return syntax_failure("source contains a syntax error".to_string());
        }

        let mut walk = Walk {
            src: source.as_bytes(),
            caps,
            violations: Vec::new(),
        };
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            walk.visit(node);
            let mut cursor = node.walk();
            stack.extend(node.named_children(&mut cursor));
        }

        let mut violations = walk.violations;
        if violations.is_empty() {
            return ValidationResult::Valid;
        }
        violations.sort_by_key(|v| match v.location {
            Location::Line { line, column } => (line, column),
            Location::Unknown => (0, 0),
        });
        ValidationResult::Invalid(violations)
    }
}

fn syntax_failure(message: String) -> ValidationResult {
    ValidationResult::Invalid(vec![Violation::new(
        ViolationRule::Syntax,
        message,
        Location::Unknown,
    )])
}

fn location_of(node: Node<'_>) -> Location {
    let pos = node.start_position();
    Location::Line {
        line: pos.row + 1,
        column: pos.column + 1,
    }
}

struct Walk<'a> {
    src: &'a [u8],
    caps: Capabilities,
    violations: Vec<Violation>,
}

impl<'a> Walk<'a> {
    fn text(&self, node: Node<'_>) -> &'a str {
        node.utf8_text(self.src).unwrap_or_default()
    }

    fn flag(&mut self, rule: ViolationRule, message: String, node: Node<'_>) {
        self.violations
            .push(Violation::new(rule, message, location_of(node)));
    }

    fn visit(&mut self, node: Node<'_>) {
        match node.kind() {
            "import_statement" => self.check_import(node),
            "import_from_statement" => self.check_import_from(node),
            "call" => self.check_call(node),
            "attribute" => self.check_attribute(node),
            "identifier" => self.check_identifier(node),
            _ => {}
        }
    }

    fn check_module(&mut self, module: &str, node: Node<'_>) {
        match policy::classify_module(module, self.caps) {
            ModuleVerdict::Allowed => {}
            ModuleVerdict::NeedsNetwork => self.flag(
                ViolationRule::NetworkImport,
                format!("import '{module}' requires the network capability"),
                node,
            ),
            ModuleVerdict::Forbidden => self.flag(
                ViolationRule::DisallowedImport,
                format!("import '{module}' is not allowed"),
                node,
            ),
        }
    }

    fn check_import(&mut self, node: Node<'_>) {
        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let target = if name.kind() == "aliased_import" {
                name.child_by_field_name("name").unwrap_or(name)
            } else {
                name
            };
            let module = self.text(target).to_string();
            self.check_module(&module, target);
        }
    }

    fn check_import_from(&mut self, node: Node<'_>) {
        let Some(module_node) = node.child_by_field_name("module_name") else {
            return;
        };
        let module = self.text(module_node).to_string();
        if module_node.kind() == "relative_import" {
            self.flag(
                ViolationRule::RelativeImport,
                format!("relative import '{module}' is not allowed"),
                module_node,
            );
        } else {
            self.check_module(&module, module_node);
        }

        let mut cursor = node.walk();
        let names: Vec<Node<'_>> = node.children_by_field_name("name", &mut cursor).collect();
        for name in names {
            let target = if name.kind() == "aliased_import" {
                name.child_by_field_name("name").unwrap_or(name)
            } else {
                name
            };
            let imported = self.text(target).to_string();
            if DYNAMIC_EVAL_CALLS.contains(&imported.as_str()) {
                self.flag(
                    ViolationRule::DynamicEvaluation,
                    format!("importing '{imported}' from '{module}' is not allowed"),
                    target,
                );
            } else if policy::is_dangerous_call(&imported) {
                self.flag(
                    ViolationRule::DangerousCall,
                    format!("importing '{imported}' from '{module}' is not allowed"),
                    target,
                );
            }
        }
    }

    fn check_call(&mut self, node: Node<'_>) {
        let Some(function) = node.child_by_field_name("function") else {
            return;
        };
        match function.kind() {
            "identifier" => {
                let name = self.text(function).to_string();
                if DYNAMIC_EVAL_CALLS.contains(&name.as_str()) {
                    self.flag(
                        ViolationRule::DynamicEvaluation,
                        format!("call to '{name}()' is not allowed"),
                        function,
                    );
                } else if REFLECTIVE_CALLS.contains(&name.as_str()) {
                    self.check_name_argument(node, function, &name, 1);
                } else if NAME_GETTER_CALLS.contains(&name.as_str()) {
                    self.check_name_argument(node, function, &name, 0);
                } else if policy::is_dangerous_call(&name) {
                    self.flag(
                        ViolationRule::DangerousCall,
                        format!("call to '{name}()' is not allowed"),
                        function,
                    );
                }
            }
            "attribute" => {
                let Some(attr) = function.child_by_field_name("attribute") else {
                    return;
                };
                let name = self.text(attr).to_string();
                let receiver = function
                    .child_by_field_name("object")
                    .map(|o| self.text(o).to_string())
                    .unwrap_or_default();
                if DYNAMIC_EVAL_METHODS.contains(&name.as_str()) {
                    self.flag(
                        ViolationRule::DynamicEvaluation,
                        format!("call to '{receiver}.{name}()' is not allowed"),
                        function,
                    );
                } else if policy::is_dangerous_call(&name) {
                    self.flag(
                        ViolationRule::DangerousCall,
                        format!("call to '{receiver}.{name}()' is not allowed"),
                        function,
                    );
                } else if NAME_GETTER_CALLS.contains(&name.as_str()) {
                    self.check_name_argument(node, function, &format!("{receiver}.{name}"), 0);
                }
            }
            _ => {}
        }
    }

    fn check_name_argument(
        &mut self,
        call: Node<'_>,
        function: Node<'_>,
        label: &str,
        index: usize,
    ) {
        if !self.has_safe_name_argument(call, index) {
            self.flag(
                ViolationRule::DynamicEvaluation,
                format!("'{label}()' is only allowed with a literal name of a permitted attribute"),
                function,
            );
        }
    }

    /// The positional argument at `index` is a plain string literal naming
    /// something that would pass validation if written out directly.
    fn has_safe_name_argument(&self, call: Node<'_>, index: usize) -> bool {
        let Some(args) = call.child_by_field_name("arguments") else {
            return false;
        };
        let mut cursor = args.walk();
        let positional: Vec<Node<'_>> = args
            .named_children(&mut cursor)
            .filter(|n| n.kind() != "keyword_argument" && n.kind() != "comment")
            .collect();
        let Some(attr) = positional.get(index) else {
            return false;
        };
        if attr.kind() != "string" {
            return false;
        }
        let mut cursor = attr.walk();
        let mut literal = String::new();
        for part in attr.named_children(&mut cursor) {
            match part.kind() {
                "string_content" => literal.push_str(self.text(part)),
                "string_start" | "string_end" => {}
                _ => return false,
            }
        }
        !policy::is_unsafe_attribute_name(&literal)
    }

    fn check_attribute(&mut self, node: Node<'_>) {
        let Some(attr) = node.child_by_field_name("attribute") else {
            return;
        };
        let name = self.text(attr).to_string();
        if INTROSPECTION_ATTRS.contains(&name.as_str()) {
            self.flag(
                ViolationRule::IntrospectionAttribute,
                format!("access to '{name}' is not allowed"),
                attr,
            );
        } else if !is_call_function(node)
            && (policy::is_dangerous_call(&name) || DYNAMIC_EVAL_METHODS.contains(&name.as_str()))
        {
            // Calls are reported by check_call; this catches `f = os.system`.
            let receiver = node
                .child_by_field_name("object")
                .map(|o| self.text(o).to_string())
                .unwrap_or_default();
            self.flag(
                ViolationRule::DangerousCall,
                format!("reference to '{receiver}.{name}' is not allowed"),
                attr,
            );
        }
    }

    fn check_identifier(&mut self, node: Node<'_>) {
        let name = self.text(node);
        if name == "__builtins__" {
            if !is_attribute_field(node) {
                self.flag(
                    ViolationRule::IntrospectionAttribute,
                    "access to '__builtins__' is not allowed".to_string(),
                    node,
                );
            }
        } else if EVAL_REFERENCES.contains(&name) && is_plain_reference(node) {
            let name = name.to_string();
            self.flag(
                ViolationRule::DynamicEvaluation,
                format!("reference to '{name}' is not allowed"),
                node,
            );
        }
    }
}

fn is_call_function(node: Node<'_>) -> bool {
    node.parent().is_some_and(|p| {
        p.kind() == "call" && p.child_by_field_name("function") == Some(node)
    })
}

fn is_attribute_field(node: Node<'_>) -> bool {
    node.parent().is_some_and(|p| {
        p.kind() == "attribute" && p.child_by_field_name("attribute") == Some(node)
    })
}

/// An identifier used as a value, excluding positions already reported as a
/// call or that only name something (attribute fields, keyword names,
/// definitions and parameters).
fn is_plain_reference(node: Node<'_>) -> bool {
    let Some(parent) = node.parent() else {
        return true;
    };
    let field_is = |field: &str| parent.child_by_field_name(field) == Some(node);
    match parent.kind() {
        "call" => !field_is("function"),
        "attribute" => !field_is("attribute"),
        "keyword_argument" => !field_is("name"),
        "function_definition" | "class_definition" => !field_is("name"),
        "parameters" | "default_parameter" | "typed_parameter" | "typed_default_parameter" => {
            false
        }
        "dotted_name" | "aliased_import" => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(src: &str) -> ValidationResult {
        CodeValidator::default().validate(src, Capabilities::none())
    }

    fn rules(result: &ValidationResult) -> Vec<ViolationRule> {
        result.violations().iter().map(|v| v.rule).collect()
    }

    #[test]
    fn test_plain_server_is_valid() {
        let src = r#"
import json
from datetime import datetime
import os.path as osp

def handle(req):
    data = json.loads(req)
    pattern = getattr(data, "pattern", None)
    return json.dumps({"ok": True, "when": datetime.now().isoformat(), "dir": osp.sep})
"#;
        assert_eq!(check(src), ValidationResult::Valid);
    }

    #[test]
    fn test_re_compile_is_not_dynamic_evaluation() {
        let src = "import re\nWORD = re.compile(r\"\\w+\")\n";
        assert!(check(src).is_valid());
    }

    #[test]
    fn test_network_import_without_capability() {
        let src = "import json\nimport httpx\n";
        let result = check(src);
        assert_eq!(rules(&result), vec![ViolationRule::NetworkImport]);
        let v = &result.violations()[0];
        assert!(v.message.contains("httpx"));
        assert_eq!(v.location, Location::Line { line: 2, column: 8 });

        let with_net = CodeValidator::default().validate(src, Capabilities::with_network());
        assert!(with_net.is_valid());
    }

    #[test]
    fn test_disallowed_and_relative_imports() {
        let result = check("import subprocess\nfrom . import helpers\nfrom ctypes import CDLL\n");
        assert_eq!(
            rules(&result),
            vec![
                ViolationRule::DisallowedImport,
                ViolationRule::RelativeImport,
                ViolationRule::DisallowedImport,
            ]
        );
    }

    #[test]
    fn test_dynamic_evaluation_calls() {
        let result = check("x = eval('1+1')\nexec('pass')\ncode = compile('1', 'f', 'eval')\n");
        assert_eq!(result.violations().len(), 3);
        assert!(rules(&result)
            .iter()
            .all(|r| *r == ViolationRule::DynamicEvaluation));
    }

    #[test]
    fn test_eval_reference_is_flagged() {
        let result = check("f = eval\n");
        assert_eq!(rules(&result), vec![ViolationRule::DynamicEvaluation]);
    }

    #[test]
    fn test_reflective_calls_need_literal_names() {
        assert!(check("v = getattr(obj, 'name')\n").is_valid());
        assert_eq!(
            rules(&check("v = getattr(obj, name)\n")),
            vec![ViolationRule::DynamicEvaluation]
        );
        assert_eq!(
            rules(&check("v = getattr(obj, '__class__')\n")),
            vec![ViolationRule::DynamicEvaluation]
        );
        assert_eq!(
            rules(&check("v = getattr(obj, f'{x}')\n")),
            vec![ViolationRule::DynamicEvaluation]
        );
    }

    #[test]
    fn test_reflective_names_checked_against_policy() {
        for src in [
            "import os\ngetattr(os, 'system')('id')\n",
            "frame = getattr(gen, 'gi_frame')\n",
            "import importlib\nf = getattr(importlib, 'import_module')\n",
            "import operator\nrun = operator.attrgetter('system')\n",
            "from operator import methodcaller\nmethodcaller('popen', 'id')\n",
            "import operator\nfetch = operator.attrgetter('path.__dict__')\n",
        ] {
            assert!(
                rules(&check(src)).contains(&ViolationRule::DynamicEvaluation),
                "expected rejection: {src}"
            );
        }
        assert!(check("import operator\nkey = operator.attrgetter('name')\n").is_valid());
    }

    #[test]
    fn test_dangerous_attribute_reference() {
        let result = check("import os\nrun = os.system\nrun('id')\n");
        assert_eq!(rules(&result), vec![ViolationRule::DangerousCall]);
        assert!(result.violations()[0].message.contains("os.system"));
    }

    #[test]
    fn test_dangerous_calls_on_any_receiver() {
        let result = check("import os\nos.system('ls')\nos.execvp('sh', ['sh'])\n");
        assert_eq!(
            rules(&result),
            vec![ViolationRule::DangerousCall, ViolationRule::DangerousCall]
        );
    }

    #[test]
    fn test_from_import_of_dangerous_name() {
        let result = check("from os import system, getcwd\n");
        assert_eq!(rules(&result), vec![ViolationRule::DangerousCall]);
        assert!(result.violations()[0].message.contains("system"));
    }

    #[test]
    fn test_introspection_attributes() {
        let result = check("x = ().__class__.__bases__[0].__subclasses__()\n");
        assert_eq!(result.violations().len(), 3);
        assert!(rules(&result)
            .iter()
            .all(|r| *r == ViolationRule::IntrospectionAttribute));
    }

    #[test]
    fn test_bare_builtins_name() {
        let result = check("b = __builtins__\n");
        assert_eq!(rules(&result), vec![ViolationRule::IntrospectionAttribute]);
    }

    #[test]
    fn test_syntax_error_has_unknown_location() {
        let result = check("def broken(:\n    pass\n");
        assert_eq!(result.violations().len(), 1);
        let v = &result.violations()[0];
        assert_eq!(v.rule, ViolationRule::Syntax);
        assert_eq!(v.location, Location::Unknown);
    }

    #[test]
    fn test_source_size_limit() {
        let validator = CodeValidator::new(16);
        let result = validator.validate("import json\nprint(json.dumps(1))\n", Capabilities::none());
        assert_eq!(rules(&result), vec![ViolationRule::SourceTooLarge]);
    }

    #[test]
    fn test_violations_sorted_by_position() {
        let result = check("import socket\nimport subprocess\n");
        let lines: Vec<usize> = result
            .violations()
            .iter()
            .filter_map(|v| match v.location {
                Location::Line { line, .. } => Some(line),
                Location::Unknown => None,
            })
            .collect();
        assert_eq!(lines, vec![1, 2]);
    }
}
