//! Module graph: validation and dependency-ordered traversal.

use std::collections::{BTreeMap, BTreeSet};

use super::{Input, ManifestError, Module};

/// A validated, topologically sorted module DAG.
///
/// Construction proves the graph acyclic and every reference resolvable;
/// all traversals afterwards are infallible.
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    /// Topological order: an input always precedes its consumer.
    modules: Vec<Module>,
    index: BTreeMap<String, usize>,
}

impl ModuleGraph {
    pub fn new(modules: Vec<Module>) -> Result<Self, ManifestError> {
        let mut index = BTreeMap::new();
        for (i, module) in modules.iter().enumerate() {
            if index.insert(module.name.clone(), i).is_some() {
                return Err(ManifestError::DuplicateModule {
                    name: module.name.clone(),
                });
            }
        }

        for module in &modules {
            for input in &module.inputs {
                let Some(dep) = input.module_dependency() else {
                    continue;
                };
                let Some(&dep_idx) = index.get(dep) else {
                    return Err(ManifestError::UnknownModule {
                        module: module.name.clone(),
                        name: dep.to_string(),
                    });
                };
                let dep_module = &modules[dep_idx];
                match input {
                    Input::Map { .. } if dep_module.kind.is_store() => {
                        return Err(ManifestError::BadInput {
                            module: module.name.clone(),
                            reason: format!("map input {dep:?} is a store module"),
                        });
                    }
                    Input::Store { .. } if !dep_module.kind.is_store() => {
                        return Err(ManifestError::BadInput {
                            module: module.name.clone(),
                            reason: format!("store input {dep:?} is a map module"),
                        });
                    }
                    _ => {}
                }
            }
        }

        let order = topo_sort(&modules, &index)?;
        let modules: Vec<Module> = order.into_iter().map(|i| modules[i].clone()).collect();
        let index = modules
            .iter()
            .enumerate()
            .map(|(i, m)| (m.name.clone(), i))
            .collect();

        Ok(Self { modules, index })
    }

    pub fn get(&self, name: &str) -> Option<&Module> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    /// All modules, in dependency order.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    /// The transitive ancestor set of `outputs` (outputs included), in
    /// dependency order.
    pub fn modules_down_to(&self, outputs: &[String]) -> Result<Vec<&Module>, ManifestError> {
        let mut wanted = BTreeSet::new();
        for name in outputs {
            let Some(&i) = self.index.get(name) else {
                return Err(ManifestError::UnknownOutputModule { name: name.clone() });
            };
            self.collect_ancestors(i, &mut wanted);
        }
        Ok(self
            .modules
            .iter()
            .enumerate()
            .filter(|(i, _)| wanted.contains(i))
            .map(|(_, m)| m)
            .collect())
    }

    /// As [`modules_down_to`](Self::modules_down_to), restricted to store
    /// modules.
    pub fn stores_down_to(&self, outputs: &[String]) -> Result<Vec<&Module>, ManifestError> {
        Ok(self
            .modules_down_to(outputs)?
            .into_iter()
            .filter(|m| m.kind.is_store())
            .collect())
    }

    /// Names of the store modules `name` transitively reads (via `get` or
    /// `deltas` inputs), excluding itself.
    pub fn store_ancestors(&self, name: &str) -> Result<Vec<String>, ManifestError> {
        let Some(&i) = self.index.get(name) else {
            return Err(ManifestError::UnknownOutputModule {
                name: name.to_string(),
            });
        };
        let mut wanted = BTreeSet::new();
        self.collect_ancestors(i, &mut wanted);
        wanted.remove(&i);
        Ok(self
            .modules
            .iter()
            .enumerate()
            .filter(|(j, m)| wanted.contains(j) && m.kind.is_store())
            .map(|(_, m)| m.name.clone())
            .collect())
    }

    fn collect_ancestors(&self, at: usize, seen: &mut BTreeSet<usize>) {
        if !seen.insert(at) {
            return;
        }
        for input in &self.modules[at].inputs {
            if let Some(dep) = input.module_dependency() {
                let dep_idx = self.index[dep];
                self.collect_ancestors(dep_idx, seen);
            }
        }
    }
}

fn topo_sort(
    modules: &[Module],
    index: &BTreeMap<String, usize>,
) -> Result<Vec<usize>, ManifestError> {
    #[derive(Copy, Clone, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        at: usize,
        modules: &[Module],
        index: &BTreeMap<String, usize>,
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<(), ManifestError> {
        match marks[at] {
            Mark::Black => return Ok(()),
            Mark::Grey => {
                return Err(ManifestError::Cycle {
                    name: modules[at].name.clone(),
                })
            }
            Mark::White => {}
        }
        marks[at] = Mark::Grey;
        for input in &modules[at].inputs {
            if let Some(dep) = input.module_dependency() {
                visit(index[dep], modules, index, marks, order)?;
            }
        }
        marks[at] = Mark::Black;
        order.push(at);
        Ok(())
    }

    let mut marks = vec![Mark::White; modules.len()];
    let mut order = Vec::with_capacity(modules.len());
    for at in 0..modules.len() {
        visit(at, modules, index, &mut marks, &mut order)?;
    }
    Ok(order)
}
