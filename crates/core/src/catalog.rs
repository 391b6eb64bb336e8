//! Built-in campaign catalog.
//!
//! Ready-made definitions a tenant can start from. Each entry is a complete
//! workflow with `id = 0` and `tenant_id = 0`; [`instantiate`] stamps the
//! tenant, validates it, and returns a paused draft the caller persists.

use chrono::{TimeZone, Utc};
use serde::Serialize;
use serde_json::json;

use crate::condition::ANNIVERSARY;
use crate::error::CoreError;
use crate::types::{DbId, Timestamp};
use crate::workflow::{
    validate_definition, Action, ActionKind, Condition, EventFilters, RecurrenceRule, Trigger,
    WorkflowDefinition, WorkflowStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignCategory {
    Sales,
    Marketing,
    Support,
    Seasonal,
    Nurture,
}

impl CampaignCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sales => "sales",
            Self::Marketing => "marketing",
            Self::Support => "support",
            Self::Seasonal => "seasonal",
            Self::Nurture => "nurture",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    pub id: &'static str,
    pub description: &'static str,
    pub category: CampaignCategory,
    pub tags: &'static [&'static str],
    pub definition: WorkflowDefinition,
}

/// Every built-in campaign.
pub fn builtin() -> Vec<CatalogEntry> {
    vec![
        black_friday(),
        holiday_season(),
        new_lead_nurture(),
        abandoned_cart(),
        win_back(),
        post_purchase(),
        birthday(),
        webinar_funnel(),
    ]
}

pub fn find(id: &str) -> Option<CatalogEntry> {
    builtin().into_iter().find(|e| e.id == id)
}

pub fn by_category(category: CampaignCategory) -> Vec<CatalogEntry> {
    builtin()
        .into_iter()
        .filter(|e| e.category == category)
        .collect()
}

/// Case-insensitive search over name, description and tags.
pub fn search(query: &str) -> Vec<CatalogEntry> {
    let query = query.to_lowercase();
    builtin()
        .into_iter()
        .filter(|e| {
            e.definition.name.to_lowercase().contains(&query)
                || e.description.to_lowercase().contains(&query)
                || e.tags.iter().any(|t| t.contains(&query))
        })
        .collect()
}

/// A validated, paused copy of catalog entry `id` owned by `tenant_id`.
pub fn instantiate(id: &str, tenant_id: DbId) -> Result<WorkflowDefinition, CoreError> {
    let entry = find(id).ok_or_else(|| {
        CoreError::Validation(format!("Unknown catalog campaign '{id}'"))
    })?;
    let mut def = entry.definition;
    def.tenant_id = tenant_id;
    def.status = WorkflowStatus::Paused;
    validate_definition(&def)?;
    Ok(def)
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

fn draft(
    name: &str,
    triggers: Vec<Trigger>,
    conditions: Vec<Condition>,
    actions: Vec<Action>,
    variables: &[&str],
) -> WorkflowDefinition {
    WorkflowDefinition {
        id: 0,
        tenant_id: 0,
        name: name.to_string(),
        status: WorkflowStatus::Paused,
        version: 1,
        triggers,
        conditions,
        actions,
        variables: variables.iter().map(|v| v.to_string()).collect(),
    }
}

/// Scheduled campaigns are authored in New York local time; these are the
/// UTC instants.
fn utc(year: i32, month: u32, day: u32, hour: u32) -> Timestamp {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
        .single()
        .expect("valid catalog instant")
}

fn black_friday() -> CatalogEntry {
    CatalogEntry {
        id: "black-friday-campaign",
        description: "Black Friday promotion with multi-channel outreach and countdown reminders",
        category: CampaignCategory::Seasonal,
        tags: &["black-friday", "sales", "email", "sms", "urgent"],
        definition: draft(
            "Black Friday Flash Sale",
            // 2025-11-28 00:00 America/New_York
            vec![Trigger::Scheduled {
                at: utc(2025, 11, 28, 5),
            }],
            vec![
                Condition::new("contact_type", "in", json!(["customer", "lead", "subscriber"])),
                Condition::new("email_verified", "equals", json!(true)),
            ],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    0,
                    json!({
                        "subject": "BLACK FRIDAY: {{discount}}% OFF - Exclusive Early Access!",
                        "body": "Hi {{firstName}},\n\nBlack Friday is here with {{discount}}% OFF everything in store.\n\nLimited time: {{hours_remaining}} hours remaining.\nFree shipping on orders over ${{free_shipping_threshold}}.\n\nShop now: {{shop_url}}\n\n{{company_name}}",
                        "template": "promotional"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendSms,
                    180,
                    json!({
                        "message": "BLACK FRIDAY ALERT! {{discount}}% OFF ends in {{hours_remaining}}hrs! Shop now: {{short_url}}"
                    }),
                ),
                Action::new(
                    2,
                    ActionKind::SendEmail,
                    1440,
                    json!({
                        "subject": "Last Chance: {{discount}}% OFF Ends Tonight!",
                        "body": "{{firstName}}, only {{hours_remaining}} hours left!\n\nDon't miss out on {{discount}}% OFF our entire collection.\n\nFinal hours to save big: {{shop_url}}\n\n{{company_name}}",
                        "template": "urgent"
                    }),
                ),
                Action::new(
                    3,
                    ActionKind::CreateDeal,
                    10,
                    json!({
                        "stage": "black-friday-engaged",
                        "value": 0,
                        "tags": ["black-friday-2025", "email-opened"]
                    }),
                ),
            ],
            &[
                "discount",
                "free_shipping_threshold",
                "shop_url",
                "short_url",
                "company_name",
            ],
        ),
    }
}

fn holiday_season() -> CatalogEntry {
    CatalogEntry {
        id: "holiday-season-campaign",
        description: "Multi-week holiday campaign with a gift guide and last-minute deals",
        category: CampaignCategory::Seasonal,
        tags: &["holidays", "christmas", "email", "gifts"],
        definition: draft(
            "Holiday Season Marketing",
            // 2025-12-01 09:00 America/New_York
            vec![Trigger::Scheduled {
                at: utc(2025, 12, 1, 14),
            }],
            vec![Condition::new("last_purchase_date", "less_than_days_ago", json!(365))],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    0,
                    json!({
                        "subject": "Holiday Gift Guide: Perfect Presents for Everyone",
                        "body": "Dear {{firstName}},\n\nThe holiday season is here!\n\nTop picks for {{recipient_type}}, gift bundles from ${{min_price}} and free gift wrapping on all orders.\n\nBrowse our holiday collection: {{gift_guide_url}}\n\n{{company_name}}",
                        "template": "seasonal"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendEmail,
                    10080,
                    json!({
                        "subject": "Week 2: Holiday Deals + Last-Minute Gifts",
                        "body": "Hi {{firstName}},\n\nStill searching for the perfect gift? New arrivals and flash deals just landed.\n\nGuaranteed delivery before Christmas when you order by {{cutoff_date}}.\n\nShop now: {{shop_url}}\n\n{{company_name}}",
                        "template": "promotional"
                    }),
                ),
            ],
            &[
                "recipient_type",
                "min_price",
                "gift_guide_url",
                "cutoff_date",
                "shop_url",
                "company_name",
            ],
        ),
    }
}

fn post_purchase() -> CatalogEntry {
    CatalogEntry {
        id: "post-purchase-followup",
        description: "Thank-you, product tips and review request after an order",
        category: CampaignCategory::Support,
        tags: &["support", "review", "education"],
        definition: draft(
            "Post-Purchase Follow-Up",
            vec![Trigger::Event {
                event_name: "purchase_completed".into(),
                filters: EventFilters::default(),
            }],
            vec![Condition::new("order_total", "greater_than", json!(0))],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    60,
                    json!({
                        "subject": "Thank you for your order!",
                        "body": "Hi {{firstName}},\n\nOrder #{{order_number}} is confirmed and will ship within {{shipping_days}} business days.\n\nTrack your order: {{tracking_url}}\n\nQuestions? We're here to help: {{support_email}}\n\n{{company_name}}",
                        "template": "transactional"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendEmail,
                    4320,
                    json!({
                        "subject": "Getting the most from your {{product_name}}",
                        "body": "Hey {{firstName}},\n\nSome tips for your new {{product_name}}:\n1. {{tip_1}}\n2. {{tip_2}}\n3. {{tip_3}}\n\nWatch the tutorial: {{tutorial_url}}\n\n{{company_name}}",
                        "template": "educational"
                    }),
                ),
                Action::new(
                    2,
                    ActionKind::SendEmail,
                    10080,
                    json!({
                        "subject": "How's everything going with your {{product_name}}?",
                        "body": "Hi {{firstName}},\n\nWe'd love to hear about your experience.\n\nLeave a review (takes 2 minutes): {{review_url}}\n\nAs a thank you, you'll get {{reward}} for your honest review.\n\n{{company_name}}",
                        "template": "feedback"
                    }),
                ),
            ],
            &[
                "order_number",
                "shipping_days",
                "tracking_url",
                "support_email",
                "product_name",
                "tip_1",
                "tip_2",
                "tip_3",
                "tutorial_url",
                "review_url",
                "reward",
                "company_name",
            ],
        ),
    }
}

fn webinar_funnel() -> CatalogEntry {
    CatalogEntry {
        id: "webinar-funnel",
        description: "Webinar funnel from registration to post-event offer",
        category: CampaignCategory::Marketing,
        tags: &["webinar", "email", "education", "conversion"],
        definition: draft(
            "Webinar Registration & Follow-Up",
            vec![Trigger::Event {
                event_name: "webinar_registered".into(),
                filters: EventFilters::default(),
            }],
            vec![Condition::new("webinar_registered", "equals", json!(true))],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    0,
                    json!({
                        "subject": "You're registered for {{webinar_title}}!",
                        "body": "Hi {{firstName}},\n\nYou're all set.\n\nDate: {{webinar_date}}\nTime: {{webinar_time}} {{timezone}}\nTopic: {{webinar_title}}\n\nWhat you'll learn:\n- {{learning_point_1}}\n- {{learning_point_2}}\n- {{learning_point_3}}\n\nAdd to calendar: {{calendar_url}}\nJoin live: {{webinar_url}}\n\n{{host_name}}",
                        "template": "event"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendEmail,
                    1440,
                    json!({
                        "subject": "Tomorrow: {{webinar_title}} - Last minute prep!",
                        "body": "Hey {{firstName}},\n\nJust 24 hours until our webinar. Join early and bring your questions.\n\nTomorrow at {{webinar_time}}: {{webinar_url}}\n\n{{host_name}}",
                        "template": "reminder"
                    }),
                ),
                Action::new(
                    2,
                    ActionKind::SendSms,
                    2880,
                    json!({
                        "message": "Starting in 1 hour! Join {{webinar_title}}: {{webinar_url}} - {{host_name}}"
                    }),
                ),
                Action::new(
                    3,
                    ActionKind::SendEmail,
                    3000,
                    json!({
                        "subject": "Thank you for attending! Here's your exclusive offer",
                        "body": "Hi {{firstName}},\n\nThanks for joining us.\n\nRecording: {{recording_url}}\nSlides: {{slides_url}}\n\n{{discount}}% OFF with code {{promo_code}}, valid for {{expiry_hours}} hours: {{offer_url}}?code={{promo_code}}\n\n{{host_name}}",
                        "template": "follow-up"
                    }),
                ),
            ],
            &[
                "webinar_title",
                "webinar_date",
                "webinar_time",
                "timezone",
                "learning_point_1",
                "learning_point_2",
                "learning_point_3",
                "calendar_url",
                "webinar_url",
                "host_name",
                "recording_url",
                "slides_url",
                "discount",
                "promo_code",
                "expiry_hours",
                "offer_url",
            ],
        ),
    }
}

fn birthday() -> CatalogEntry {
    CatalogEntry {
        id: "birthday-campaign",
        description: "Birthday wishes with a personal discount code",
        category: CampaignCategory::Marketing,
        tags: &["birthday", "email", "sms", "loyalty"],
        definition: draft(
            "Birthday Celebration Campaign",
            vec![Trigger::Recurring {
                rule: RecurrenceRule::AnniversaryOf {
                    field: "birthday".into(),
                    days_before: 0,
                },
            }],
            vec![
                Condition::new("birthday", "is_today", json!(ANNIVERSARY)),
                Condition::new("email_verified", "equals", json!(true)),
            ],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    0,
                    json!({
                        "subject": "Happy Birthday, {{firstName}}! Here's a gift for you",
                        "body": "Happy Birthday, {{firstName}}!\n\nEnjoy {{discount}}% off your next purchase for {{validity_days}} days with code BDAY{{year}}.\n\nTreat yourself: {{shop_url}}\n\n{{company_name}}",
                        "template": "celebration"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendSms,
                    30,
                    json!({
                        "message": "Happy Birthday {{firstName}}! Enjoy {{discount}}% OFF with code BDAY{{year}}: {{short_url}}"
                    }),
                ),
            ],
            &["discount", "validity_days", "shop_url", "short_url", "company_name"],
        ),
    }
}

fn abandoned_cart() -> CatalogEntry {
    CatalogEntry {
        id: "abandoned-cart-recovery",
        description: "Recover abandoned carts with follow-up emails and a last-chance SMS",
        category: CampaignCategory::Sales,
        tags: &["cart", "conversion", "email", "sms"],
        definition: draft(
            "Abandoned Cart Recovery",
            vec![Trigger::Event {
                event_name: "cart_abandoned".into(),
                filters: EventFilters::default(),
            }],
            vec![
                Condition::new("cart_total", "greater_than", json!(50)),
                Condition::new("phone_verified", "equals", json!(true)),
            ],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    60,
                    json!({
                        "subject": "You left something behind...",
                        "body": "Hi {{firstName}},\n\nYou left {{item_count}} item(s) in your cart:\n{{cart_items}}\n\nTotal: ${{cart_total}}\n\nComplete your order: {{cart_url}}\n\n{{company_name}}",
                        "template": "transactional"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendEmail,
                    1440,
                    json!({
                        "subject": "Still interested? Here's {{discount}}% OFF!",
                        "body": "{{firstName}}, your items are waiting.\n\n{{discount}}% OFF with code {{discount_code}}: now ${{discounted_total}}.\n\nOffer ends in {{hours_remaining}} hours: {{cart_url}}",
                        "template": "promotional"
                    }),
                ),
                Action::new(
                    2,
                    ActionKind::SendSms,
                    2880,
                    json!({
                        "message": "Last chance! Your cart expires soon. {{discount}}% OFF waiting: {{short_url}}"
                    }),
                ),
            ],
            &[
                "item_count",
                "cart_items",
                "cart_total",
                "cart_url",
                "discount",
                "discounted_total",
                "discount_code",
                "short_url",
                "company_name",
            ],
        ),
    }
}

fn win_back() -> CatalogEntry {
    CatalogEntry {
        id: "win-back-campaign",
        description: "Re-engage customers who have not purchased in 90+ days",
        category: CampaignCategory::Sales,
        tags: &["retention", "email", "discount"],
        definition: draft(
            "Win-Back Inactive Customers",
            vec![Trigger::Recurring {
                rule: RecurrenceRule::Inactivity {
                    field: "days_since_last_purchase".into(),
                    days: 90,
                },
            }],
            vec![Condition::new("total_purchases", "greater_than", json!(0))],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    0,
                    json!({
                        "subject": "We miss you, {{firstName}}!",
                        "body": "Hi {{firstName}},\n\nIt's been a while. Here's what's new: {{website_url}}\n\n{{company_name}}",
                        "template": "re-engagement"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendEmail,
                    10080,
                    json!({
                        "subject": "We want you back: {{discount}}% OFF + Free Shipping",
                        "body": "{{firstName}}, here's {{discount}}% off everything for {{validity_days}} days.\n\nYour code: {{promo_code}}\nShop now: {{shop_url}}?code={{promo_code}}\n\n{{company_name}}",
                        "template": "win-back"
                    }),
                ),
                Action::new(
                    2,
                    ActionKind::CreateDeal,
                    10,
                    json!({
                        "title": "Win-back: {{firstName}} {{lastName}}",
                        "stage": "win-back-engaged",
                        "value": 0,
                        "tags": ["win-back-campaign", "discount-sent"]
                    }),
                ),
            ],
            &[
                "website_url",
                "discount",
                "validity_days",
                "promo_code",
                "shop_url",
                "company_name",
            ],
        ),
    }
}

fn new_lead_nurture() -> CatalogEntry {
    CatalogEntry {
        id: "new-lead-nurture",
        description: "Seven-day welcome sequence for new leads ending in a sales follow-up",
        category: CampaignCategory::Nurture,
        tags: &["nurture", "email", "education", "conversion"],
        definition: draft(
            "New Lead Nurture Sequence",
            vec![Trigger::Event {
                event_name: "contact_created".into(),
                filters: EventFilters::default(),
            }],
            vec![Condition::new("contact_type", "equals", json!("lead"))],
            vec![
                Action::new(
                    0,
                    ActionKind::SendEmail,
                    0,
                    json!({
                        "subject": "Welcome to {{company_name}}",
                        "body": "Hi {{firstName}},\n\nWelcome! Get started here: {{onboarding_url}}\n\n{{sender_name}}",
                        "template": "welcome"
                    }),
                ),
                Action::new(
                    1,
                    ActionKind::SendEmail,
                    4320,
                    json!({
                        "subject": "3 quick tips to get more from {{product_name}}",
                        "body": "Hey {{firstName}},\n\nMore in our resources: {{resources_url}}\n\n{{sender_name}}",
                        "template": "educational"
                    }),
                ),
                Action::new(
                    2,
                    ActionKind::SendEmail,
                    4320,
                    json!({
                        "subject": "Special offer: {{discount}}% OFF for new members",
                        "body": "Hi {{firstName}},\n\n{{discount}}% off, valid {{validity_hours}} hours: {{offer_url}}\n\n{{sender_name}}",
                        "template": "conversion"
                    }),
                ),
                Action::new(
                    3,
                    ActionKind::CreateTask,
                    20,
                    json!({
                        "title": "Follow up with {{firstName}} on nurture campaign",
                        "description": "Check if lead needs personal outreach",
                        "due_in_days": 1,
                        "priority": "normal"
                    }),
                ),
            ],
            &[
                "company_name",
                "sender_name",
                "product_name",
                "onboarding_url",
                "resources_url",
                "discount",
                "validity_hours",
                "offer_url",
            ],
        ),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
