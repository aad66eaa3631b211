//! Evidence rules mapping events onto development stages and coding
//! sub-stages.

use devlens_model::{
    AiPayload, CodingSubStage, ContextTag, Event, EventCategory, FilePayload,
    GitPayload, Stage,
};
use once_cell::sync::Lazy;
use regex::Regex;

pub(crate) struct StageRule {
    pub stage: Stage,
    pub weight: f64,
    pattern: Regex,
}

pub(crate) struct SubStageRule {
    pub sub: CodingSubStage,
    pub weight: f64,
    pattern: Regex,
}

macro_rules! stage_rules {
    ($(($stage:expr, $weight:expr, $pattern:expr)),+ $(,)?) => {
        vec![
            $(StageRule {
                stage: $stage,
                weight: $weight,
                pattern: Regex::new($pattern).expect("stage rule regex"),
            }),+
        ]
    };
}

macro_rules! sub_stage_rules {
    ($(($sub:expr, $weight:expr, $pattern:expr)),+ $(,)?) => {
        vec![
            $(SubStageRule {
                sub: $sub,
                weight: $weight,
                pattern: Regex::new($pattern).expect("sub-stage rule regex"),
            }),+
        ]
    };
}

static STAGE_RULES: Lazy<Vec<StageRule>> = Lazy::new(|| {
    stage_rules![
        (Stage::Prd, 2.5, r"(?i)(prd|product[-_ ]?requirements?|requirements\.md)"),
        (Stage::Planning, 2.0, r"(?i)(roadmap|milestones?|backlog|sprint|planning)"),
        (Stage::Erd, 2.5, r"(?i)(erd|\.sql\b|migrations?/|db[-_ ]?schema|entity[-_ ]?relation)"),
        (Stage::Wireframe, 2.5, r"(?i)(wireframes?|mock-?ups?|low[-_ ]?fi)"),
        (Stage::ScreenDesign, 2.5, r"(?i)(screen[-_ ]?design|figma|\.sketch\b|design[-_ ]?tokens?)"),
        (Stage::Design, 1.5, r"(?i)(architecture|adr[-_/]|design[-_ ]?docs?|system[-_ ]?design)"),
        (Stage::Frontend, 1.5, r"(?i)(\.tsx\b|\.jsx\b|\.vue\b|\.svelte\b|\.css\b|\.scss\b|components?/|pages?/|ui/)"),
        (Stage::Backend, 1.5, r"(?i)(api/|server/|controllers?/|services?/|handlers?/|routes?/|endpoints?)"),
        (Stage::AiCollab, 1.5, r"(?i)(prompts?/|\.prompt\b|copilot|claude|assistant)"),
        (Stage::Deployment, 2.0, r"(?i)(dockerfile|docker-compose|k8s/|helm/|\.github/workflows|deploy|release)"),
        (Stage::Operation, 2.0, r"(?i)(runbooks?|incidents?|alerts?|monitoring/|ops/|on-?call)"),
    ]
});

static SUB_STAGE_RULES: Lazy<Vec<SubStageRule>> = Lazy::new(|| {
    sub_stage_rules![
        (CodingSubStage::UseCase, 2.0, r"(?i)(use[-_ ]?cases?)"),
        (CodingSubStage::EventStorming, 2.0, r"(?i)(event[-_ ]?storming)"),
        (CodingSubStage::DomainModeling, 2.0, r"(?i)(domain/|entities/|aggregates?/|value[-_ ]?objects?)"),
        (CodingSubStage::UseCaseDetail, 1.5, r"(?i)(use[-_ ]?case[-_ ]?detail|scenario)"),
        (CodingSubStage::AiPromptDesign, 2.0, r"(?i)(prompts?[-_/]|prompt[-_ ]?design)"),
        (CodingSubStage::BusinessLogic, 1.0, r"(?i)(services?/|logic|usecases?/)"),
        (CodingSubStage::Refactoring, 2.0, r"(?i)(refactor)"),
        (CodingSubStage::UnitTest, 2.0, r"(?i)(unit[-_ ]?tests?|_test\.|\.test\.|\.spec\.)"),
        (CodingSubStage::IntegrationTest, 2.0, r"(?i)(integration[-_ ]?tests?|tests?/integration)"),
        (CodingSubStage::E2eTest, 2.0, r"(?i)(e2e|end[-_ ]?to[-_ ]?end|playwright|cypress)"),
    ]
});

/// Text extracted from an event that stage rules match against.
fn evidence_texts(event: &Event) -> Vec<String> {
    let mut texts = vec![event.event_type.clone()];
    match event.category {
        EventCategory::File => {
            if let Ok(payload) = FilePayload::from_value(&event.data) {
                if let Some(path) = payload.new_path {
                    texts.push(path);
                }
                if let Some(path) = payload.old_path {
                    texts.push(path);
                }
            }
        }
        EventCategory::Git => {
            if let Ok(payload) = GitPayload::from_value(&event.data) {
                if let Some(message) = payload.message {
                    texts.push(message);
                }
                if let Some(branch) = payload.branch {
                    texts.push(branch);
                }
            }
        }
        _ => {}
    }
    texts
}

/// Score an event against every stage. Category-level evidence comes first,
/// text rules refine it.
pub(crate) fn score_stages(event: &Event) -> Vec<(Stage, f64)> {
    let mut scores: Vec<(Stage, f64)> = Vec::new();
    let mut add = |stage: Stage, weight: f64| {
        match scores.iter_mut().find(|(s, _)| *s == stage) {
            Some((_, sum)) => *sum += weight,
            None => scores.push((stage, weight)),
        }
    };

    match event.category {
        // Stage classification feeds off raw activity, not its own output.
        EventCategory::Stage => return scores,
        EventCategory::Git => add(Stage::Git, 1.0),
        EventCategory::Ai => add(Stage::AiCollab, 1.5),
        EventCategory::Test | EventCategory::Build => add(Stage::Coding, 1.0),
        EventCategory::File => {
            if let Ok(payload) = FilePayload::from_value(&event.data) {
                match payload.context_tag {
                    ContextTag::Source | ContextTag::Test => {
                        add(Stage::Coding, 1.0)
                    }
                    ContextTag::Docs => add(Stage::Prd, 0.25),
                    ContextTag::Build => add(Stage::Deployment, 0.5),
                    ContextTag::Config => {}
                }
            }
        }
        _ => {}
    }

    let texts = evidence_texts(event);
    for rule in STAGE_RULES.iter() {
        if texts.iter().any(|text| rule.pattern.is_match(text)) {
            add(rule.stage, rule.weight);
        }
    }
    scores
}

pub(crate) fn score_sub_stages(event: &Event) -> Vec<(CodingSubStage, f64)> {
    let mut scores: Vec<(CodingSubStage, f64)> = Vec::new();
    let mut add = |sub: CodingSubStage, weight: f64| {
        match scores.iter_mut().find(|(s, _)| *s == sub) {
            Some((_, sum)) => *sum += weight,
            None => scores.push((sub, weight)),
        }
    };

    // First implementation: fresh source files appearing.
    if event.category == EventCategory::File
        && let Ok(payload) = FilePayload::from_value(&event.data)
        && payload.context_tag == ContextTag::Source
        && payload.action == devlens_model::FileAction::Add
    {
        add(CodingSubStage::FirstImplementation, 1.0);
    }
    if event.category == EventCategory::Ai
        && let Ok(payload) = AiPayload::from_value(&event.data)
        && payload.interaction_type == devlens_model::AiInteraction::Prompt
    {
        add(CodingSubStage::AiPromptDesign, 0.5);
    }

    let texts = evidence_texts(event);
    for rule in SUB_STAGE_RULES.iter() {
        if texts.iter().any(|text| rule.pattern.is_match(text)) {
            add(rule.sub, rule.weight);
        }
    }
    scores
}

/// Next-step hints surfaced with the stage snapshot.
pub(crate) fn suggestions_for(stage: Stage) -> Vec<String> {
    let hints: &[&str] = match stage {
        Stage::Prd => &[
            "Break requirements into a delivery plan",
            "Capture open questions before design starts",
        ],
        Stage::Planning => &[
            "Turn the plan into an entity/data model",
            "Size milestones against the roadmap",
        ],
        Stage::Erd => &["Validate the schema with a walking skeleton"],
        Stage::Wireframe | Stage::ScreenDesign | Stage::Design => &[
            "Promote approved designs into frontend work",
        ],
        Stage::Frontend | Stage::Backend | Stage::Coding => &[
            "Keep tests moving with the implementation",
            "Commit in small conventional units",
        ],
        Stage::AiCollab => &["Review AI suggestions before accepting in bulk"],
        Stage::Git => &["Open a pull request while context is fresh"],
        Stage::Deployment => &["Watch the rollout and capture metrics"],
        Stage::Operation => &["File follow-ups for recurring incidents"],
    };
    hints.iter().map(|hint| hint.to_string()).collect()
}
