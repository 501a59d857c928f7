//! Prompt Composer.
//!
//! Builds the instruction text sent to the hosted model from a fixed
//! teaching policy, the active difficulty, the current document, and a
//! snapshot of the learner's history. Composition is pure: identical
//! inputs always produce identical text.
//!
//! Sections appear in a fixed order under stable markers so that a logged
//! prompt can be split back into its parts:
//!
//! ```text
//! === TEACHING POLICY ===
//! === DIFFICULTY: <level> ===
//! === DOCUMENT EXCERPT ===      (only when a document is loaded)
//! === LEARNING HISTORY ===      (only when the learner has history)
//! ```

use serde::{Deserialize, Serialize};

use crate::document::{excerpt, is_truncated};
use crate::learning::LearningSnapshot;

/// Default number of document characters included in any prompt.
pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 8000;

/// Marker opening the policy section.
pub const POLICY_MARKER: &str = "=== TEACHING POLICY ===";
/// Marker opening the document section.
pub const DOCUMENT_MARKER: &str = "=== DOCUMENT EXCERPT ===";
/// Marker opening the learner-history section.
pub const HISTORY_MARKER: &str = "=== LEARNING HISTORY ===";

/// The pedagogical protocol every session turn follows.
pub const TEACHING_POLICY: &str = r#"You are Erudite, an autonomous pedagogical teaching agent created by expert educators.
You are NOT a chatbot. You are a teaching system that follows strict pedagogical principles.

You have been given the content of an academic document. Your role is to teach this material effectively to a student.

FOR EVERY SINGLE RESPONSE, YOU MUST FOLLOW THESE THREE STEPS IN ORDER:

**STEP 1: MISCONCEPTION DETECTION**
- Carefully analyze the student's question for any false premises or incorrect assumptions
- If the student has a misconception, you MUST correct it BEFORE answering their question
- Use phrases like: "I notice you're assuming X, but actually..." or "Before I answer, let me clarify a common misconception..."
- If no misconception is detected, proceed to Step 2

**STEP 2: CONCEPT-AWARE TEACHING**
Explain the concept at the difficulty level given below.
Always ground your explanations in the uploaded document. Reference specific sections, examples, or definitions from the material using quotes when helpful.

**STEP 3: MICRO-ASSESSMENT**
You MUST end EVERY response with exactly ONE short diagnostic question to test understanding.
Format it EXACTLY like this:

🎯 **Quick Check:** [Your question here]

The question should:
- Test the concept you just explained
- Be answerable in 1-2 sentences
- Help identify if the student truly understood

FORMATTING RULES:
- Use markdown for clear formatting
- Use bullet points for lists
- Use **bold** for key terms
- Use code blocks for formulas or technical notation
- Keep explanations focused and not too long

PERSONALITY:
- Be encouraging and patient
- Celebrate when students understand correctly
- Never make students feel stupid for not knowing something

Remember: You are an expert teacher, not just an AI. Every response should feel like a thoughtful lesson from a caring instructor."#;

/// Persona used by the stateless chat endpoints.
pub const TUTOR_PERSONA: &str = "You are Aletheia, an expert academic tutor designed to help students learn effectively.

Your teaching style:
- BEGINNER-FRIENDLY: Assume the student is new to the topic
- STEP-BY-STEP: Break down complex concepts into small, digestible steps
- SIMPLE LANGUAGE: Avoid jargon; when technical terms are needed, explain them
- EXAMPLES: Use real-world examples and analogies to illustrate concepts
- ENCOURAGING: Be supportive and patient

Response format:
- Use markdown for formatting (headers, lists, code blocks)
- Keep paragraphs short (2-3 sentences max)
- End with a quick comprehension check when appropriate

Remember: Your goal is to help students truly UNDERSTAND, not just memorize.";

// ============================================================================
// Difficulty
// ============================================================================

/// How a reply should be pitched.
///
/// Alters prompt phrasing only, never application logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Difficulty {
    /// Simple language, analogies, tiny steps (default).
    #[default]
    Beginner,
    /// Technical terms with explanations.
    Intermediate,
    /// Exam-relevant points and formulas.
    Exam,
}

impl Difficulty {
    /// Parses a string into a `Difficulty`, case-insensitively.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "beginner" => Some(Self::Beginner),
            "intermediate" => Some(Self::Intermediate),
            "exam" => Some(Self::Exam),
            _ => None,
        }
    }

    /// Parses a difficulty, falling back to [`Difficulty::Beginner`] for
    /// unrecognized input.
    #[must_use]
    pub fn parse_or_default(s: &str) -> Self {
        Self::from_str_case_insensitive(s).unwrap_or_else(|| {
            tracing::warn!(requested = %s, fallback = %Self::default(), "Unknown difficulty, using default");
            Self::default()
        })
    }

    /// Lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Beginner => "beginner",
            Self::Intermediate => "intermediate",
            Self::Exam => "exam",
        }
    }

    /// One-line teaching directive for this level.
    #[must_use]
    pub const fn directive(self) -> &'static str {
        match self {
            Self::Beginner => {
                "Use very simple language, lots of analogies, and break everything into tiny steps."
            }
            Self::Intermediate => {
                "Use some technical terms (with explanations) and make connections between concepts."
            }
            Self::Exam => "Focus on exam-relevant points, formulas, and common test questions.",
        }
    }
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Difficulty {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse_or_default(&s))
    }
}

impl Serialize for Difficulty {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

// ============================================================================
// Composer
// ============================================================================

/// Composes per-turn system instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptComposer {
    policy: String,
    max_document_chars: usize,
}

impl Default for PromptComposer {
    fn default() -> Self {
        Self::new(TEACHING_POLICY, DEFAULT_MAX_DOCUMENT_CHARS)
    }
}

impl PromptComposer {
    /// Creates a composer with the given policy text and excerpt budget.
    #[must_use]
    pub fn new(policy: impl Into<String>, max_document_chars: usize) -> Self {
        Self {
            policy: policy.into(),
            max_document_chars,
        }
    }

    /// The excerpt budget in characters.
    #[must_use]
    pub const fn max_document_chars(&self) -> usize {
        self.max_document_chars
    }

    /// Composes the instruction text for one turn.
    ///
    /// `document` is cut to the first `max_document_chars` characters; the
    /// cut is lossy. Empty documents and empty snapshots omit their
    /// sections entirely.
    #[must_use]
    pub fn compose(
        &self,
        difficulty: Difficulty,
        document: &str,
        snapshot: &LearningSnapshot,
    ) -> String {
        if is_truncated(document, self.max_document_chars) {
            tracing::debug!(
                document_chars = document.chars().count(),
                kept = self.max_document_chars,
                "Document excerpted for prompt"
            );
        }
        compose(
            &self.policy,
            difficulty,
            document,
            snapshot,
            self.max_document_chars,
        )
    }
}

/// Composes a prompt from explicit inputs.
///
/// See [`PromptComposer::compose`].
#[must_use]
pub fn compose(
    policy: &str,
    difficulty: Difficulty,
    document: &str,
    snapshot: &LearningSnapshot,
    max_document_chars: usize,
) -> String {
    let mut prompt = String::with_capacity(policy.len() + max_document_chars + 512);

    prompt.push_str(POLICY_MARKER);
    prompt.push('\n');
    prompt.push_str(policy);

    prompt.push_str("\n\n=== DIFFICULTY: ");
    prompt.push_str(difficulty.as_str());
    prompt.push_str(" ===\n");
    prompt.push_str(difficulty.directive());

    if !document.trim().is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(DOCUMENT_MARKER);
        prompt.push_str(
            "\nThe student is learning from the following document. Ground all your explanations in this material:\n\n",
        );
        prompt.push_str(excerpt(document, max_document_chars));
    }

    if !snapshot.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(HISTORY_MARKER);
        prompt.push_str(
            "\nThe following shows the student's past misconceptions and areas of weakness. Pay special attention to these topics:\n\n",
        );
        prompt.push_str(&serde_json::to_string_pretty(snapshot).unwrap_or_default());
    }

    prompt
}

// ============================================================================
// Relay prompts
// ============================================================================

/// System instruction for `POST /api/chat/context`.
#[must_use]
pub fn context_chat_instruction(
    context: Option<&str>,
    difficulty: Difficulty,
    max_document_chars: usize,
) -> String {
    let mut prompt = TUTOR_PERSONA.to_string();

    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str(
            "\n\n=== STUDY MATERIAL ===\nThe student is learning from the following document. Use this as the primary source for your explanations:\n\n",
        );
        prompt.push_str(excerpt(context, max_document_chars));
    }

    prompt.push_str("\n\n=== DIFFICULTY LEVEL: ");
    prompt.push_str(&difficulty.as_str().to_uppercase());
    prompt.push_str(" ===\n");
    prompt.push_str(difficulty.directive());
    prompt
}

/// Prompt asking for a concept map as JSON.
#[must_use]
pub fn concept_map_prompt(content: &str, max_document_chars: usize) -> String {
    format!(
        r#"Analyze this academic document and extract the key concepts and their relationships.

Return a JSON object with this exact structure:
{{
  "nodes": [
    {{ "id": "1", "name": "Concept Name", "category": "main|sub|detail" }}
  ],
  "links": [
    {{ "source": "1", "target": "2", "relationship": "requires|leads-to|part-of" }}
  ]
}}

Rules:
- Extract 5-15 key concepts
- Identify prerequisite relationships (which concepts need to be understood first)
- Use categories: "main" for primary topics, "sub" for subtopics, "detail" for specific facts
- Return ONLY valid JSON, no other text

Document content:
{}"#,
        excerpt(content, max_document_chars)
    )
}

/// Prompt asking for a markdown study plan.
#[must_use]
pub fn study_plan_prompt(
    content: &str,
    weak_concepts: &[String],
    max_document_chars: usize,
) -> String {
    let weak_line = if weak_concepts.is_empty() {
        String::new()
    } else {
        format!(
            "The student has identified these weak areas: {}",
            weak_concepts.join(", ")
        )
    };

    format!(
        "You are an expert learning strategist. Create a personalized study plan based on this academic document.

{weak_line}

Create a comprehensive study plan with:
1. **Learning Objectives** - What the student will master
2. **Prerequisites Check** - Concepts to review first
3. **Study Sessions** - Break down into 30-minute blocks
4. **Key Formulas/Definitions** - Must-know items
5. **Practice Questions** - Self-assessment questions
6. **Review Schedule** - Spaced repetition timeline

Format in clear, readable markdown.

Document content:
{}",
        excerpt(content, max_document_chars)
    )
}

/// Prompt asking for a one-page markdown revision sheet.
#[must_use]
pub fn revision_sheet_prompt(
    content: &str,
    weak_concepts: &[String],
    max_document_chars: usize,
) -> String {
    let weak_line = if weak_concepts.is_empty() {
        String::new()
    } else {
        format!(
            "Focus especially on these weak areas: {}",
            weak_concepts.join(", ")
        )
    };

    format!(
        "Create a concise one-page revision sheet from this academic document.

{weak_line}

Include:
1. **Key Definitions** (5-10 most important)
2. **Essential Formulas** (if applicable)
3. **Quick Facts** (bullet points)
4. **Common Mistakes to Avoid**
5. **Memory Tricks** (mnemonics if helpful)
6. **5-Question Quick Quiz** (with answers)

Keep it concise - this should fit on one page when printed.
Format in clean markdown.

Document content:
{}",
        excerpt(content, max_document_chars)
    )
}
