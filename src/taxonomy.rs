/**
 * The fixed vocabularies used to classify exam content, and the lookup used to repair
 * near-miss labels coming back from the content generator.
 *
 * Every question carries exactly one value on each of the four taxonomy axes. Labels
 * arriving from outside the crate are matched in three passes: exact match after
 * normalization, the alias table, and finally the closest label by edit distance.
 */
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

/// Implemented by every enumerated vocabulary so that `repair` can work on any of them.
pub trait Labeled: Copy + Sized + 'static {
    fn all() -> &'static [Self];
    fn label(self) -> &'static str;
    /// Alternative spellings, already in normalized form.
    fn aliases() -> &'static [(&'static str, Self)];
}

macro_rules! labeled_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident => $label:expr),+ $(,)?
        }
        aliases {
            $($alias:expr => $target:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl Labeled for $name {
            fn all() -> &'static [Self] {
                $name::ALL
            }

            fn label(self) -> &'static str {
                $name::label(self)
            }

            fn aliases() -> &'static [(&'static str, Self)] {
                &[$(($alias, $name::$target)),*]
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.label())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let key = normalize_label(s);
                $name::ALL
                    .iter()
                    .copied()
                    .find(|v| normalize_label(v.label()) == key)
                    .ok_or_else(|| format!("unknown {} '{}'", stringify!($name), s))
            }
        }
    };
}

labeled_enum! {
    /// The top-level exam domains. Quiz distributions are expressed over this axis.
    CompetencyArea {
        GeneralConcepts => "General Security Concepts",
        ThreatsAndVulnerabilities => "Threats and Vulnerabilities",
        Architecture => "Security Architecture",
        Operations => "Security Operations",
        ProgramManagement => "Program Management and Oversight",
    }
    aliases {
        "generalconcepts" => GeneralConcepts,
        "concepts" => GeneralConcepts,
        "threats" => ThreatsAndVulnerabilities,
        "threatsvulnerabilities" => ThreatsAndVulnerabilities,
        "vulnerabilities" => ThreatsAndVulnerabilities,
        "architecture" => Architecture,
        "operations" => Operations,
        "secops" => Operations,
        "programmanagement" => ProgramManagement,
        "governance" => ProgramManagement,
        "oversight" => ProgramManagement,
    }
}

labeled_enum! {
    SkillCategory {
        Cryptography => "Cryptography",
        IdentityAndAccess => "Identity and Access Management",
        NetworkSecurity => "Network Security",
        ApplicationSecurity => "Application Security",
        IncidentResponse => "Incident Response",
        RiskManagement => "Risk Management",
        Compliance => "Compliance",
        ThreatIntelligence => "Threat Intelligence",
    }
    aliases {
        "crypto" => Cryptography,
        "iam" => IdentityAndAccess,
        "identitymanagement" => IdentityAndAccess,
        "accessmanagement" => IdentityAndAccess,
        "netsec" => NetworkSecurity,
        "appsec" => ApplicationSecurity,
        "ir" => IncidentResponse,
        "risk" => RiskManagement,
        "cti" => ThreatIntelligence,
    }
}

labeled_enum! {
    SkillTopic {
        Encryption => "Encryption",
        Hashing => "Hashing",
        Pki => "Public Key Infrastructure",
        Authentication => "Authentication",
        Authorization => "Authorization",
        Firewalls => "Firewalls",
        Wireless => "Wireless Security",
        SecureCoding => "Secure Coding",
        Malware => "Malware",
        SocialEngineering => "Social Engineering",
        Forensics => "Digital Forensics",
        VulnerabilityScanning => "Vulnerability Scanning",
        BusinessContinuity => "Business Continuity",
        Auditing => "Auditing",
    }
    aliases {
        "pki" => Pki,
        "authn" => Authentication,
        "authz" => Authorization,
        "wifi" => Wireless,
        "forensics" => Forensics,
        "phishing" => SocialEngineering,
        "bcp" => BusinessContinuity,
        "disasterrecovery" => BusinessContinuity,
        "audit" => Auditing,
    }
}

labeled_enum! {
    TestSubject {
        Knowledge => "Knowledge",
        Application => "Application",
        Analysis => "Analysis",
        Scenario => "Scenario",
    }
    aliases {
        "recall" => Knowledge,
        "definition" => Knowledge,
        "applied" => Application,
        "performancebased" => Scenario,
        "casestudy" => Scenario,
    }
}

labeled_enum! {
    Difficulty {
        Beginner => "beginner",
        Intermediate => "intermediate",
        Advanced => "advanced",
    }
    aliases {
        "easy" => Beginner,
        "basic" => Beginner,
        "medium" => Intermediate,
        "moderate" => Intermediate,
        "hard" => Advanced,
        "expert" => Advanced,
    }
}

labeled_enum! {
    /// Lifecycle of a question in the catalog. Only `Active` questions are served.
    QuestionStatus {
        Active => "active",
        Review => "review",
        Retired => "retired",
        Draft => "draft",
    }
    aliases {}
}

labeled_enum! {
    /// The four labeled options every question carries.
    OptionLabel {
        A => "A",
        B => "B",
        C => "C",
        D => "D",
    }
    aliases {}
}

impl OptionLabel {
    pub fn index(self) -> usize {
        match self {
            OptionLabel::A => 0,
            OptionLabel::B => 1,
            OptionLabel::C => 2,
            OptionLabel::D => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        OptionLabel::ALL.get(index).copied()
    }
}

/// Reduce a label to lowercase ASCII alphanumerics so that spacing, punctuation,
/// accents and ampersands do not matter when comparing.
pub fn normalize_label(raw: &str) -> String {
    label_words(raw).concat()
}

/// Like `normalize_label`, but with any standalone "and" dropped, so that
/// "threats & vulnerabilities" and "threats vulnerabilities" share a key.
fn alias_key(raw: &str) -> String {
    label_words(raw).into_iter().filter(|w| w != "and").collect()
}

fn label_words(raw: &str) -> Vec<String> {
    let cleaned: String = raw
        .replace('&', " and ")
        .nfkd()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() || c.is_ascii_punctuation() {
                Some(' ')
            } else {
                None
            }
        })
        .collect();
    cleaned.split_whitespace().map(String::from).collect()
}

/// Map a possibly misspelled label onto the nearest value of `T`, or `None` if nothing
/// is close enough.
pub fn repair<T: Labeled>(raw: &str) -> Option<T> {
    let key = normalize_label(raw);
    if key.is_empty() {
        return None;
    }

    let keys: Vec<(String, T)> = T::all()
        .iter()
        .map(|&v| (normalize_label(v.label()), v))
        .collect();

    if let Some((_, v)) = keys.iter().find(|(k, _)| *k == key) {
        return Some(*v);
    }

    let stripped = alias_key(raw);
    for &(alias, v) in T::aliases() {
        if alias == key || alias == stripped {
            return Some(v);
        }
    }

    let mut best: Option<(usize, T, usize)> = None;
    for (label_key, v) in keys.iter() {
        let distance = edit_distance(&key, label_key);
        let is_better = match best {
            Some((d, _, _)) => distance < d,
            None => true,
        };
        if is_better {
            best = Some((distance, *v, label_key.len()));
        }
    }

    match best {
        Some((distance, v, len)) if distance <= threshold(len) => Some(v),
        _ => None,
    }
}

fn threshold(len: usize) -> usize {
    // Short labels such as option letters must match exactly.
    if len < 4 {
        0
    } else {
        std::cmp::max(2, len / 4)
    }
}

/// Levenshtein distance over characters.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];

    for i in 1..=a.len() {
        current[0] = i;
        for j in 1..=b.len() {
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            current[j] = (previous[j] + 1)
                .min(current[j - 1] + 1)
                .min(previous[j - 1] + cost);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}
