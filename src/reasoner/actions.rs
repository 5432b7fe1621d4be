//! Catalog of reasoning actions the search orders

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReasoningAction {
    pub name: &'static str,
    pub instruction: &'static str,
}

pub const ACTIONS: [ReasoningAction; 5] = [
    ReasoningAction {
        name: "identify_question_intent",
        instruction: "Restate what the question asks for, including the period, the unit and \
whether a ratio, a difference or a percentage is expected.",
    },
    ReasoningAction {
        name: "recall_financial_formula",
        instruction: "Name the standard financial formula that answers the question and write \
it as `Formula: <expression>`.",
    },
    ReasoningAction {
        name: "map_variables",
        instruction: "List every input the formula needs as `Variable N: <description>`, naming \
the line item and period each one refers to.",
    },
    ReasoningAction {
        name: "decompose_calculation",
        instruction: "Break the computation into ordered intermediate steps that can each be \
evaluated from the variables.",
    },
    ReasoningAction {
        name: "check_units_and_scale",
        instruction: "Check that all inputs share units and scale (thousands, millions, \
percentages) and state any conversion the calculation needs.",
    },
];

pub fn catalog() -> Vec<String> {
    ACTIONS.iter().map(|a| a.name.to_string()).collect()
}

pub fn find(name: &str) -> Option<&'static ReasoningAction> {
    ACTIONS.iter().find(|a| a.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_names_are_unique_and_resolvable() {
        let names = catalog();
        let mut deduped = names.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ACTIONS.len());
        assert!(names.iter().all(|n| find(n).is_some()));
        assert!(find("guess").is_none());
    }
}
