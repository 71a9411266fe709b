//! iDesign component categorization.
//!
//! Paths under the agent-output root may declare a component category via
//! their first matching directory segment (`Managers/`, `Engines/`,
//! `Accessors/`, `Utilities/`). Categorized files must follow the
//! category's naming convention.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// The four iDesign component categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComponentCategory {
    Managers,
    Engines,
    Accessors,
    Utilities,
}

impl ComponentCategory {
    /// Directory segment that declares this category.
    pub fn segment(&self) -> &'static str {
        match self {
            ComponentCategory::Managers => "Managers",
            ComponentCategory::Engines => "Engines",
            ComponentCategory::Accessors => "Accessors",
            ComponentCategory::Utilities => "Utilities",
        }
    }

    /// Required file-stem suffix for files in this category.
    pub fn stem_suffix(&self) -> &'static str {
        match self {
            ComponentCategory::Managers => "Manager",
            ComponentCategory::Engines => "Engine",
            ComponentCategory::Accessors => "Accessor",
            ComponentCategory::Utilities => "Utility",
        }
    }

    /// Infer the category from a relative path, if any segment declares one.
    pub fn infer(relative: &Path) -> Option<ComponentCategory> {
        for component in relative.components() {
            let segment = component.as_os_str().to_str()?;
            for category in [
                ComponentCategory::Managers,
                ComponentCategory::Engines,
                ComponentCategory::Accessors,
                ComponentCategory::Utilities,
            ] {
                if segment == category.segment() {
                    return Some(category);
                }
            }
        }
        None
    }

    /// Whether the file stem follows this category's naming convention.
    pub fn stem_conforms(&self, relative: &Path) -> bool {
        relative
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem.ends_with(self.stem_suffix()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_category_from_segment() {
        assert_eq!(
            ComponentCategory::infer(Path::new("Managers/OrderManager.cs")),
            Some(ComponentCategory::Managers)
        );
        assert_eq!(
            ComponentCategory::infer(Path::new("src/Engines/PricingEngine.cs")),
            Some(ComponentCategory::Engines)
        );
        assert_eq!(ComponentCategory::infer(Path::new("src/lib.rs")), None);
    }

    #[test]
    fn stem_convention() {
        let cat = ComponentCategory::Accessors;
        assert!(cat.stem_conforms(Path::new("Accessors/CardAccessor.cs")));
        assert!(!cat.stem_conforms(Path::new("Accessors/CardStore.cs")));
    }
}
