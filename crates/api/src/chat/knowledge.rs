//! Knowledge retrieval for the studio assistant
//!
//! A small fixed set of studio facts plus the published FAQs, ranked by
//! token overlap with the visitor's question. Titles count double.

use std::borrow::Cow;
use std::collections::HashSet;

use studio_shared::Faq;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

const TITLE_WEIGHT: usize = 2;

/// Words that carry no meaning for matching (English and Portuguese)
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "can", "do", "does", "for", "from", "how", "i",
    "in", "is", "it", "me", "my", "of", "on", "or", "the", "to", "what", "when", "where", "which",
    "who", "why", "with", "you", "your", "we", "our", "there", "this", "that", "have", "has",
    "o", "os", "as", "um", "uma", "de", "da", "do", "das", "dos", "e", "em", "no", "na", "nos",
    "nas", "para", "por", "com", "que", "qual", "quais", "como", "se", "eu", "voce", "voces",
    "meu", "minha", "ao", "aos", "ha", "tem", "ter", "ser", "sao", "esta",
];

/// One retrievable piece of knowledge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnowledgeEntry {
    pub title: Cow<'static, str>,
    pub content: Cow<'static, str>,
}

impl KnowledgeEntry {
    const fn fixed(title: &'static str, content: &'static str) -> Self {
        Self {
            title: Cow::Borrowed(title),
            content: Cow::Borrowed(content),
        }
    }
}

impl From<&Faq> for KnowledgeEntry {
    fn from(faq: &Faq) -> Self {
        Self {
            title: Cow::Owned(faq.question.clone()),
            content: Cow::Owned(faq.answer.clone()),
        }
    }
}

/// Facts that hold regardless of admin-managed content
pub static STUDIO_FACTS: &[KnowledgeEntry] = &[
    KnowledgeEntry::fixed(
        "How to book a session",
        "Create an account, pick a free slot on the booking page, choose the service and confirm. \
         Paid bookings are held for a short time while you complete the payment.",
    ),
    KnowledgeEntry::fixed(
        "Services offered",
        "We offer recording, mixing, mastering, rehearsal and podcast sessions.",
    ),
    KnowledgeEntry::fixed(
        "Payment methods",
        "Bookings and plans are paid online by card through Stripe Checkout. \
         Cash payments can be arranged at the studio and are recorded by our staff.",
    ),
    KnowledgeEntry::fixed(
        "Cancellation policy",
        "You can cancel a booking from your account up to the cancellation notice period before \
         it starts. A coupon used on a cancelled booking becomes available again.",
    ),
    KnowledgeEntry::fixed(
        "Plans and coupons",
        "Plans give you a set of coupons for discounted or free hours. Monthly plans renew \
         automatically and issue new coupons every month. Apply a coupon code when booking.",
    ),
    KnowledgeEntry::fixed(
        "Unpaid booking expired",
        "If a booking is not paid within the hold time, the slot is released and the booking is \
         cancelled automatically. You can book again at any time.",
    ),
];

/// Lowercase, strip accents, drop punctuation and stopwords
pub fn normalize(text: &str) -> Vec<String> {
    let folded: String = text
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    folded
        .split_whitespace()
        .filter(|t| t.chars().count() > 1 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// Entries available to one assistant reply
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    entries: Vec<KnowledgeEntry>,
}

impl KnowledgeBase {
    /// Static facts followed by the given published FAQs
    pub fn with_faqs(faqs: &[Faq]) -> Self {
        let mut entries = STUDIO_FACTS.to_vec();
        entries.extend(faqs.iter().filter(|f| f.is_published).map(KnowledgeEntry::from));
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn score(query: &HashSet<String>, entry: &KnowledgeEntry) -> usize {
        let title: HashSet<String> = normalize(&entry.title).into_iter().collect();
        let content: HashSet<String> = normalize(&entry.content).into_iter().collect();

        query
            .iter()
            .map(|token| {
                let mut s = 0;
                if title.contains(token) {
                    s += TITLE_WEIGHT;
                }
                if content.contains(token) {
                    s += 1;
                }
                s
            })
            .sum()
    }

    /// The `k` best matching entries with a positive score, best first
    pub fn retrieve(&self, query: &str, k: usize) -> Vec<&KnowledgeEntry> {
        let tokens: HashSet<String> = normalize(query).into_iter().collect();
        if tokens.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize, &KnowledgeEntry)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (Self::score(&tokens, e), i, e))
            .filter(|(score, _, _)| *score > 0)
            .collect();

        // Higher score first; ties keep insertion order
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored.into_iter().take(k).map(|(_, _, e)| e).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn faq(question: &str, answer: &str, published: bool) -> Faq {
        Faq {
            id: Uuid::new_v4(),
            question: question.to_string(),
            answer: answer.to_string(),
            category: None,
            sort_order: 0,
            is_published: published,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn test_normalize_strips_accents_and_stopwords() {
        assert_eq!(
            normalize("Qual é o preço da sessão de GRAVAÇÃO?"),
            vec!["preco", "sessao", "gravacao"]
        );
        assert_eq!(normalize("How do I book?"), vec!["book"]);
    }

    #[test]
    fn test_normalize_decomposed_input_matches_composed() {
        let composed = "m\u{fa}sica grava\u{e7}\u{e3}o";
        let decomposed = "mu\u{301}sica gravac\u{327}a\u{303}o";
        assert_eq!(normalize(composed), vec!["musica", "gravacao"]);
        assert_eq!(normalize(decomposed), normalize(composed));
    }

    #[test]
    fn test_retrieve_ranks_title_matches_first() {
        let kb = KnowledgeBase::with_faqs(&[]);
        let hits = kb.retrieve("what is the cancellation policy", 2);
        assert_eq!(hits[0].title, "Cancellation policy");
    }

    #[test]
    fn test_retrieve_includes_published_faqs_only() {
        let kb = KnowledgeBase::with_faqs(&[
            faq("Do you have parking?", "Yes, free parking behind the studio.", true),
            faq("Secret draft about parking", "Not ready", false),
        ]);
        assert_eq!(kb.len(), STUDIO_FACTS.len() + 1);

        let hits = kb.retrieve("is there parking", 3);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "Yes, free parking behind the studio.");
    }

    #[test]
    fn test_retrieve_nothing_relevant() {
        let kb = KnowledgeBase::with_faqs(&[]);
        assert!(kb.retrieve("the of and", 3).is_empty());
        assert!(kb.retrieve("zebra", 3).is_empty());
        assert!(kb.retrieve("coupons", 0).is_empty());
    }
}
