//! Dependency & conflict resolver (C8): topologically orders a requested
//! service set over the catalog and reports conflicts.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::catalog::ServiceCatalog;

#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    #[error("unknown service '{0}'")]
    UnknownService(String),
    #[error("circular dependency involving '{0}'")]
    CircularDependency(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictDiagnostic {
    pub a: String,
    pub b: String,
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub conflicts: Vec<ConflictDiagnostic>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Resolve `requested` identifiers against `catalog`: returns a
/// dependency-respecting order plus non-fatal diagnostics.
pub fn resolve(
    catalog: &ServiceCatalog,
    requested: &[String],
) -> Result<(Vec<String>, Diagnostics), ResolverError> {
    let requested_set: BTreeSet<String> = requested.iter().cloned().collect();
    for id in &requested_set {
        if catalog.get(id).is_none() {
            return Err(ResolverError::UnknownService(id.clone()));
        }
    }

    // Transitive closure over required dependencies (and provides tokens).
    let mut included: BTreeSet<String> = BTreeSet::new();
    let mut stack: Vec<String> = requested_set.iter().cloned().collect();
    while let Some(id) = stack.pop() {
        if !included.insert(id.clone()) {
            continue;
        }
        let Some(def) = catalog.get(&id) else {
            return Err(ResolverError::UnknownService(id));
        };
        for dep in &def.requires {
            let provider = resolve_dependency_token(catalog, dep)?;
            if !included.contains(&provider) {
                stack.push(provider);
            }
        }
        // Soft dependencies create ordering edges only when already present;
        // they never pull in new services during closure computation.
    }

    let mut colors: HashMap<String, Color> = included.iter().map(|id| (id.clone(), Color::White)).collect();
    let mut order = Vec::with_capacity(included.len());

    for id in &included {
        if colors[id] == Color::White {
            visit(catalog, id, &included, &mut colors, &mut order)?;
        }
    }

    let diagnostics = detect_conflicts(catalog, &included);

    Ok((order, diagnostics))
}

fn resolve_dependency_token(catalog: &ServiceCatalog, token: &str) -> Result<String, ResolverError> {
    if catalog.get(token).is_some() {
        return Ok(token.to_string());
    }
    catalog
        .providers_of(token)
        .next()
        .map(str::to_string)
        .ok_or_else(|| ResolverError::UnknownService(token.to_string()))
}

fn visit(
    catalog: &ServiceCatalog,
    id: &str,
    included: &BTreeSet<String>,
    colors: &mut HashMap<String, Color>,
    order: &mut Vec<String>,
) -> Result<(), ResolverError> {
    colors.insert(id.to_string(), Color::Gray);

    let def = catalog.get(id).expect("id validated during closure");
    let mut edges: Vec<String> = Vec::new();
    for dep in &def.requires {
        edges.push(resolve_dependency_token(catalog, dep)?);
    }
    // Soft dependencies constrain ordering only if both participants ended
    // up in the final included set.
    for dep in &def.soft_requires {
        if included.contains(dep) {
            edges.push(dep.clone());
        }
    }

    for dep in edges {
        match colors.get(&dep).copied().unwrap_or(Color::White) {
            Color::White => visit(catalog, &dep, included, colors, order)?,
            Color::Gray => return Err(ResolverError::CircularDependency(dep)),
            Color::Black => {}
        }
    }

    colors.insert(id.to_string(), Color::Black);
    order.push(id.to_string());
    Ok(())
}

fn detect_conflicts(catalog: &ServiceCatalog, included: &BTreeSet<String>) -> Diagnostics {
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut conflicts = Vec::new();
    for a in included {
        let Some(def) = catalog.get(a) else { continue };
        for b in &def.conflicts {
            if !included.contains(b) {
                continue;
            }
            let key = if a < b {
                (a.clone(), b.clone())
            } else {
                (b.clone(), a.clone())
            };
            if seen.insert(key.clone()) {
                conflicts.push(ConflictDiagnostic {
                    a: key.0,
                    b: key.1,
                });
            }
        }
    }
    Diagnostics { conflicts }
}
