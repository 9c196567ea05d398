//! Module specifier extraction for JS/TS sources and `.d.ts` files.
//!
//! Regex based, not a parser: good enough to find what to fetch, and a
//! false positive only costs a 404.

use std::sync::LazyLock;

use regex::Regex;

static FROM_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:import|export)\s[^'";]*?\bfrom\s*['"]([^'"\n]+)['"]"#).expect("valid regex")
});
static BARE_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bimport\s*['"]([^'"\n]+)['"]"#).expect("valid regex"));
static CALL_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\b(?:require|import)\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("valid regex")
});
static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"///\s*<reference\s+(types|path)\s*=\s*['"]([^'"\n]+)['"]"#).expect("valid regex")
});

/// A dependency found inside a declaration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    /// Another package, by root name.
    Package(String),
    /// A file relative to the declaring file, as written.
    Relative(String),
}

/// Every module specifier in `source`, in order of first appearance.
pub fn module_specifiers(source: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();
    for re in [&*FROM_CLAUSE, &*BARE_IMPORT, &*CALL_IMPORT] {
        for caps in re.captures_iter(source) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);
    dedup(found.into_iter().map(|(_, s)| s))
}

/// Package roots imported by `source`, skipping relative, absolute and
/// scheme-qualified (`node:fs`, `https://…`) specifiers.
pub fn package_imports(source: &str) -> Vec<String> {
    dedup(
        module_specifiers(source)
            .iter()
            .filter(|s| is_package(s))
            .map(|s| package_root(s).to_string()),
    )
}

/// References a declaration file pulls in: triple-slash directives plus
/// its own imports.
pub fn declaration_references(code: &str) -> Vec<Reference> {
    let mut refs = Vec::new();
    for caps in REFERENCE.captures_iter(code) {
        let target = &caps[2];
        match &caps[1] {
            "types" if is_package(target) => refs.push(Reference::Package(package_root(target).into())),
            "types" => {}
            _ => refs.push(Reference::Relative(target.to_string())),
        }
    }
    for specifier in module_specifiers(code) {
        if specifier.starts_with('.') {
            refs.push(Reference::Relative(specifier));
        } else if is_package(&specifier) {
            refs.push(Reference::Package(package_root(&specifier).to_string()));
        }
    }
    let mut out: Vec<Reference> = Vec::new();
    for r in refs {
        if !out.contains(&r) {
            out.push(r);
        }
    }
    out
}

pub fn is_package(specifier: &str) -> bool {
    !specifier.is_empty() && !specifier.starts_with('.') && !specifier.starts_with('/') && !specifier.contains(':')
}

/// `@scope/pkg/deep` → `@scope/pkg`, `pkg/deep` → `pkg`.
pub fn package_root(specifier: &str) -> &str {
    let take = if specifier.starts_with('@') { 2 } else { 1 };
    match specifier.match_indices('/').nth(take - 1) {
        Some((idx, _)) => &specifier[..idx],
        None => specifier,
    }
}

/// Resolve `relative` against the directory of `base` (both
/// registry-relative paths) and point it at a `.d.ts` file.
pub fn resolve_relative(base: &str, relative: &str) -> String {
    let mut parts: Vec<&str> = base.split('/').collect();
    parts.pop();
    for seg in relative.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let joined = parts.join("/");
    if joined.ends_with(".d.ts") {
        joined
    } else if let Some(stem) = joined
        .strip_suffix(".js")
        .or_else(|| joined.strip_suffix(".ts"))
    {
        format!("{stem}.d.ts")
    } else {
        format!("{joined}.d.ts")
    }
}

fn dedup(items: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_every_import_form() {
        let src = r#"
import React, { useState } from 'react';
import {
  a,
  b,
} from "@scope/pkg/sub";
import './styles.css';
export { x } from 'lodash/fp';
export * from "./local";
const fs = require('fs-extra');
const lazy = await import('chart.js');
"#;
        assert_eq!(
            module_specifiers(src),
            vec!["react", "@scope/pkg/sub", "./styles.css", "lodash/fp", "./local", "fs-extra", "chart.js"]
        );
        assert_eq!(
            package_imports(src),
            vec!["react", "@scope/pkg", "lodash", "fs-extra", "chart.js"]
        );
    }

    #[test]
    fn skips_absolute_and_scheme_specifiers() {
        let src = "import a from '/abs/a'; import fs from 'node:fs'; import x from 'https://esm.sh/x';";
        assert!(package_imports(src).is_empty());
    }

    #[test]
    fn package_roots() {
        assert_eq!(package_root("react"), "react");
        assert_eq!(package_root("react/jsx-runtime"), "react");
        assert_eq!(package_root("@types/node"), "@types/node");
        assert_eq!(package_root("@scope/pkg/a/b"), "@scope/pkg");
        assert_eq!(package_root("@scope"), "@scope");
    }

    #[test]
    fn declaration_references_cover_directives_and_imports() {
        let dts = r#"
/// <reference types="node" />
/// <reference path="./globals.d.ts" />
import { Props } from './props';
import type { CSS } from 'csstype';
export * from 'csstype';
"#;
        assert_eq!(
            declaration_references(dts),
            vec![
                Reference::Package("node".into()),
                Reference::Relative("./globals.d.ts".into()),
                Reference::Relative("./props".into()),
                Reference::Package("csstype".into()),
            ]
        );
    }

    #[test]
    fn relative_resolution() {
        assert_eq!(resolve_relative("react/index.d.ts", "./global.d.ts"), "react/global.d.ts");
        assert_eq!(resolve_relative("react/index.d.ts", "./jsx"), "react/jsx.d.ts");
        assert_eq!(resolve_relative("pkg/dist/types/a.d.ts", "../b.js"), "pkg/dist/b.d.ts");
    }
}
