//! Fixed import/call/attribute policy shared by the static validator and the
//! runtime import guard.

use kiln_shared::Capabilities;

/// Top-level modules every server may import.
pub const ALLOWED_MODULES: &[&str] = &[
    "__future__",
    "abc",
    "asyncio",
    "base64",
    "collections",
    "contextlib",
    "copy",
    "dataclasses",
    "datetime",
    "decimal",
    "enum",
    "fractions",
    "functools",
    "hashlib",
    "io",
    "itertools",
    "json",
    "logging",
    "math",
    "mcp",
    "operator",
    "os",
    "pathlib",
    "pprint",
    "random",
    "re",
    "statistics",
    "string",
    "struct",
    "textwrap",
    "time",
    "typing",
    "uuid",
];

/// Top-level modules that require the network capability.
pub const NETWORK_MODULES: &[&str] = &[
    "aiohttp", "ftplib", "http", "httpx", "imaplib", "poplib", "requests", "smtplib", "socket",
    "ssl", "urllib", "xmlrpc",
];

/// Builtins that compile, execute or resolve code at runtime.
pub const DYNAMIC_EVAL_CALLS: &[&str] = &[
    "eval",
    "exec",
    "compile",
    "__import__",
    "import_module",
    "breakpoint",
    "globals",
    "locals",
    "vars",
];

/// Method names that resolve code dynamically regardless of receiver.
pub const DYNAMIC_EVAL_METHODS: &[&str] = &["import_module", "__import__"];

/// Reflective accessors, allowed only with a literal, safe attribute name
/// as their second argument.
pub const REFLECTIVE_CALLS: &[&str] = &["getattr", "setattr", "delattr", "hasattr"];

/// `operator` helpers that take the attribute or method name first.
pub const NAME_GETTER_CALLS: &[&str] = &["attrgetter", "methodcaller"];

const DANGEROUS_CALLS: &[&str] = &[
    "system", "popen", "fork", "forkpty", "kill", "killpg", "setuid", "setgid", "chroot", "exit",
    "quit", "_exit", "execl", "execle", "execlp", "execlpe", "execv", "execve", "execvp",
    "execvpe", "spawnl", "spawnle", "spawnlp", "spawnlpe", "spawnv", "spawnve", "spawnvp",
    "spawnvpe", "posix_spawn", "posix_spawnp", "create_subprocess_shell",
    "create_subprocess_exec",
];

/// Attributes that expose the interpreter's object graph.
pub const INTROSPECTION_ATTRS: &[&str] = &[
    "__class__",
    "__bases__",
    "__subclasses__",
    "__mro__",
    "__globals__",
    "__code__",
    "__builtins__",
    "__closure__",
    "__loader__",
    "__spec__",
    "__getattribute__",
    "__dict__",
    "f_globals",
    "f_locals",
    "f_back",
    "gi_frame",
    "tb_frame",
];

/// Classification of a top-level module name under a set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleVerdict {
    Allowed,
    NeedsNetwork,
    Forbidden,
}

#[must_use]
pub fn classify_module(module: &str, caps: Capabilities) -> ModuleVerdict {
    let top = module.split('.').next().unwrap_or(module);
    if ALLOWED_MODULES.contains(&top) {
        ModuleVerdict::Allowed
    } else if NETWORK_MODULES.contains(&top) {
        if caps.network {
            ModuleVerdict::Allowed
        } else {
            ModuleVerdict::NeedsNetwork
        }
    } else {
        ModuleVerdict::Forbidden
    }
}

/// Whether a call (or imported name) with this final identifier is dangerous.
/// `exec` itself is reported as dynamic evaluation, not here.
#[must_use]
pub fn is_dangerous_call(name: &str) -> bool {
    DANGEROUS_CALLS.contains(&name)
}

/// Whether a name handed to a reflective accessor reaches something the
/// validator would reject if written out directly. Dotted names (as
/// `attrgetter` accepts) are checked segment by segment.
#[must_use]
pub fn is_unsafe_attribute_name(name: &str) -> bool {
    name.split('.').any(|segment| {
        segment.is_empty()
            || segment.starts_with("__")
            || is_dangerous_call(segment)
            || DYNAMIC_EVAL_CALLS.contains(&segment)
            || DYNAMIC_EVAL_METHODS.contains(&segment)
            || REFLECTIVE_CALLS.contains(&segment)
            || INTROSPECTION_ATTRS.contains(&segment)
    })
}

/// Sorted module list the runtime guard admits for these capabilities.
#[must_use]
pub fn runtime_allow_list(caps: Capabilities) -> Vec<&'static str> {
    let mut modules: Vec<&'static str> = ALLOWED_MODULES.to_vec();
    if caps.network {
        modules.extend_from_slice(NETWORK_MODULES);
    }
    modules.sort_unstable();
    modules
}
