//! Breadth-first dependency resolution across ordered import sources.
//!
//! Starting from a set of module requirements, the resolver walks the
//! configured source branches in order, imports the first satisfying dist,
//! folds the dist's recorded prereqs back into the requirement set, and
//! keeps going until the worklist drains. Modules the configured core perl
//! already ships are skipped. Everything stays staged; the caller commits.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use anyhow::Result;
use thiserror::Error;
use tracing::debug;

use cpangit_domain::{combine, compare, parse_requirement, Op};

use crate::repository::Repository;
use crate::tree::archive::ArchiveTree;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("unknown import source `{0}`")]
    UnknownSource(String),
    #[error("no import source satisfies {module} ({requirement})")]
    Unsatisfiable { module: String, requirement: String },
}

/// Options for one `import_modules` call. Unset fields default from the
/// target branch's configuration.
#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    pub sources: Option<Vec<String>>,
    pub corelist_perl_version: Option<String>,
}

impl Repository {
    /// Import `reqs` (module to requirement spec) into `target`, resolving
    /// the dependency closure across the ordered import sources. Returns
    /// the number of dists imported; all changes remain staged.
    pub fn import_modules(
        &self,
        target: &Rc<RefCell<ArchiveTree>>,
        reqs: &BTreeMap<String, String>,
        options: ImportOptions,
    ) -> Result<usize> {
        if reqs.is_empty() {
            return Ok(0);
        }

        let (source_names, perl_version) = {
            let mut target = target.borrow_mut();
            let config = target.config_opt()?.cloned().unwrap_or_default();
            (
                options.sources.unwrap_or(config.default_import_sources),
                options
                    .corelist_perl_version
                    .or(config.corelist_perl_version),
            )
        };
        let target_branch = target.borrow().branch().map(str::to_string);

        let mut sources = Vec::new();
        for name in source_names {
            if Some(name.as_str()) == target_branch.as_deref() {
                // A branch is never its own import source.
                continue;
            }
            if self.store().lookup_branch(&name)?.is_none() {
                return Err(ResolveError::UnknownSource(name).into());
            }
            let tree = self.archive_tree(&name)?;
            sources.push((name, tree));
        }

        let mut pending = reqs.clone();
        let mut worklist: VecDeque<String> = pending.keys().cloned().collect();
        let mut imported = 0usize;

        while let Some(module) = worklist.pop_front() {
            let spec = pending.get(&module).cloned().unwrap_or_default();
            let requirement = parse_requirement(&spec)?;

            if let Some(perl) = &perl_version {
                if let Some(shipped) = self.corelist().provides(perl, &module) {
                    let core_satisfies = match requirement.leading() {
                        Some((Op::Ge, want)) => {
                            compare(shipped, want) != std::cmp::Ordering::Less
                        }
                        None => true,
                        Some(_) => false,
                    };
                    if core_satisfies {
                        debug!(module, perl, "satisfied by core perl");
                        continue;
                    }
                }
            }

            let already_satisfied = {
                let mut target = target.borrow_mut();
                match target.package_details()?.row(&module) {
                    Some(row) => requirement.matches(row.version.as_deref()),
                    None => false,
                }
            };
            if already_satisfied {
                continue;
            }

            let mut chosen = None;
            for (name, source) in &sources {
                let row = {
                    let mut source = source.borrow_mut();
                    source.package_details()?.row(&module).cloned()
                };
                let Some(row) = row else {
                    continue;
                };
                if !requirement.matches(row.version.as_deref()) {
                    continue;
                }
                {
                    let mut target = target.borrow_mut();
                    let mut source = source.borrow_mut();
                    target.import_dist(&mut source, &row.dist_path)?;
                }
                debug!(module, source = %name, dist = %row.dist_path, "imported");
                imported += 1;
                chosen = Some(row.dist_path);
                break;
            }
            let Some(dist_path) = chosen else {
                return Err(ResolveError::Unsatisfiable {
                    module,
                    requirement: spec,
                }
                .into());
            };

            let prereqs = target.borrow_mut().dist_prereqs(&dist_path)?;
            for (dep, dep_requirement) in prereqs {
                let existing = pending.get(&dep).cloned().unwrap_or_default();
                let combined =
                    combine([existing.as_str(), dep_requirement.to_string().as_str()])?.to_string();
                if pending.get(&dep) != Some(&combined) {
                    pending.insert(dep.clone(), combined);
                    worklist.push_back(dep);
                }
            }
        }

        Ok(imported)
    }
}
