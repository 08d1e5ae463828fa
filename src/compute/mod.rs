//! Deterministic finance engines
//!
//! Pure, side-effect-free numeric routines invoked by pipeline stages.
//! No I/O, no clock, no randomness — identical input yields identical
//! output, which is what makes session replay possible.

use std::collections::BTreeMap;

use crate::models::{Anomaly, BudgetRecommendation, Summary, Transaction};

//
// ================= Aggregation =================
//

/// Aggregate a transaction set into totals, category breakdown,
/// and savings rate.
pub fn aggregate(transactions: &[Transaction]) -> Summary {
    let mut total_income = 0.0;
    let mut total_expense = 0.0;
    let mut category_breakdown: BTreeMap<String, f64> = BTreeMap::new();
    let mut uncategorized_total = 0.0;

    for txn in transactions {
        if txn.amount > 0.0 {
            total_income += txn.amount;
        } else {
            let expense = txn.amount.abs();
            total_expense += expense;

            let category = txn
                .category
                .clone()
                .unwrap_or_else(|| "Uncategorized".to_string());
            *category_breakdown.entry(category).or_insert(0.0) += expense;

            if txn.category.is_none() {
                uncategorized_total += expense;
            }
        }
    }

    let net_savings = total_income - total_expense;
    let savings_rate = if total_income > 0.0 {
        (net_savings / total_income) * 100.0
    } else {
        0.0
    };

    Summary {
        total_income,
        total_expense,
        net_savings,
        savings_rate,
        category_breakdown,
        uncategorized_total,
    }
}

//
// ================= Anomaly Detection =================
//

const IQR_MULTIPLIER: f64 = 1.5;

fn quartiles(sorted: &[f64]) -> (f64, f64, f64) {
    if sorted.len() < 4 {
        return (0.0, 0.0, 0.0);
    }
    let n = sorted.len();
    let q1 = sorted[n / 4];
    let q3 = sorted[3 * n / 4];
    (q1, q3, q3 - q1)
}

/// Flag expenses that exceed the IQR upper bound of the expense
/// distribution. Needs at least four expenses to establish a baseline.
pub fn detect_anomalies(transactions: &[Transaction]) -> Vec<Anomaly> {
    let mut expenses: Vec<f64> = transactions
        .iter()
        .filter(|t| t.amount < 0.0)
        .map(|t| t.amount.abs())
        .collect();

    if expenses.len() < 4 {
        return Vec::new();
    }

    expenses.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let (_q1, q3, iqr) = quartiles(&expenses);
    if iqr == 0.0 {
        return Vec::new();
    }

    let upper_bound = q3 + IQR_MULTIPLIER * iqr;

    transactions
        .iter()
        .filter(|t| t.amount < 0.0)
        .filter_map(|t| {
            let expense = t.amount.abs();
            if expense > upper_bound {
                let risk_score = ((expense - upper_bound)
                    / if upper_bound > 0.0 { upper_bound } else { 1.0 })
                .min(1.0);
                Some(Anomaly {
                    transaction_id: t.transaction_id.clone(),
                    reason: format!(
                        "Expense ${:.2} exceeds IQR upper bound ${:.2}",
                        expense, upper_bound
                    ),
                    risk_score,
                })
            } else {
                None
            }
        })
        .collect()
}

//
// ================= Risk Scoring =================
//

const CATEGORY_RISK: &[(&str, f64)] = &[
    ("gambling", 0.9),
    ("cryptocurrency", 0.8),
    ("loan", 0.7),
    ("credit_card", 0.6),
    ("transfer", 0.4),
    ("shopping", 0.3),
    ("subscription", 0.3),
    ("entertainment", 0.2),
    ("utilities", 0.1),
    ("food", 0.1),
    ("transportation", 0.1),
    ("housing", 0.1),
    ("healthcare", 0.1),
    ("income", 0.0),
    ("salary", 0.0),
];

const HIGH_RISK_KEYWORDS: &[&str] = &["gambling", "casino", "lottery", "crypto"];
const DEBT_KEYWORDS: &[&str] = &["loan", "credit", "interest", "financing"];
const INCOME_KEYWORDS: &[&str] = &["salary", "payroll", "deposit", "refund"];

/// Score a single transaction in [0.0, 1.0] from its category, size,
/// and description keywords.
pub fn score_risk(transaction: &Transaction) -> f64 {
    let amount = transaction.amount;
    let abs_amount = amount.abs();
    let desc_lower = transaction.description.to_lowercase();

    let mut score = match &transaction.category {
        Some(category) => {
            let category_lower = category.to_lowercase();
            CATEGORY_RISK
                .iter()
                .find(|(name, _)| *name == category_lower)
                .map(|(_, risk)| *risk)
                .unwrap_or(0.3)
        }
        None => 0.0,
    };

    if abs_amount > 1000.0 {
        score += ((abs_amount - 1000.0) / 10_000.0).min(0.3);
    }
    if abs_amount > 5000.0 {
        score += ((abs_amount - 5000.0) / 25_000.0).min(0.2);
    }

    if amount < 0.0 {
        if HIGH_RISK_KEYWORDS.iter().any(|kw| desc_lower.contains(kw)) {
            score = score.max(0.8);
        }
        if DEBT_KEYWORDS.iter().any(|kw| desc_lower.contains(kw)) {
            score = score.max(0.6);
        }
    } else if INCOME_KEYWORDS.iter().any(|kw| desc_lower.contains(kw)) {
        score = 0.0;
    }

    (score.clamp(0.0, 1.0) * 1000.0).round() / 1000.0
}

//
// ================= Budget Allocation =================
//

struct IncomeBand {
    name: &'static str,
    below: f64,
    rules: &'static [(&'static str, f64)],
}

const INCOME_BANDS: &[IncomeBand] = &[
    IncomeBand {
        name: "low_income",
        below: 3000.0,
        rules: &[
            ("Housing", 0.30),
            ("Food", 0.20),
            ("Transportation", 0.15),
            ("Utilities", 0.10),
            ("Healthcare", 0.05),
            ("Entertainment", 0.05),
            ("Savings", 0.10),
            ("Other", 0.05),
        ],
    },
    IncomeBand {
        name: "medium_income",
        below: 7000.0,
        rules: &[
            ("Housing", 0.28),
            ("Food", 0.18),
            ("Transportation", 0.12),
            ("Utilities", 0.08),
            ("Healthcare", 0.05),
            ("Entertainment", 0.08),
            ("Savings", 0.15),
            ("Other", 0.06),
        ],
    },
    IncomeBand {
        name: "high_income",
        below: f64::INFINITY,
        rules: &[
            ("Housing", 0.25),
            ("Food", 0.15),
            ("Transportation", 0.10),
            ("Utilities", 0.06),
            ("Healthcare", 0.05),
            ("Entertainment", 0.10),
            ("Savings", 0.20),
            ("Other", 0.09),
        ],
    },
];

fn income_band(total_income: f64) -> &'static IncomeBand {
    INCOME_BANDS
        .iter()
        .find(|band| total_income < band.below)
        .unwrap_or(&INCOME_BANDS[INCOME_BANDS.len() - 1])
}

/// Suggest per-category budgets as income-band percentages, comparing
/// each against current spend. Returns an empty list when there is no
/// income to allocate.
pub fn allocate_budget(
    total_income: f64,
    category_spend: &BTreeMap<String, f64>,
) -> Vec<BudgetRecommendation> {
    if total_income <= 0.0 {
        return Vec::new();
    }

    let band = income_band(total_income);

    band.rules
        .iter()
        .map(|(category, percentage)| {
            let suggested = (total_income * percentage * 100.0).round() / 100.0;
            let current = category_spend.get(*category).copied().unwrap_or(0.0);

            let reasoning = if *category == "Savings" {
                format!(
                    "{}% target for {} earners = ${:.2}",
                    (percentage * 100.0) as u32,
                    band.name.replace('_', " "),
                    suggested
                )
            } else if current > suggested {
                format!(
                    "Current ${:.2} exceeds suggested ${:.2}. Consider reducing.",
                    current, suggested
                )
            } else if current < suggested * 0.5 {
                format!("Current ${:.2} is well below suggested ${:.2}", current, suggested)
            } else {
                format!(
                    "Within recommended range (${:.2} - ${:.2})",
                    suggested * 0.8,
                    suggested * 1.2
                )
            };

            BudgetRecommendation {
                category: category.to_string(),
                suggested_budget: suggested,
                reasoning,
            }
        })
        .collect()
}
