use rcd_extract::{contractor_id_from_url, extract_detail_fields, parse_listing_cards};

const LISTING_PAGE: &str = r#"
<html><body>
  <div class="certification-card"><span>Showing 1-10 of 42 contractors</span></div>
  <div class="certification-card">
    <h3>Acme Roofing</h3>
    <span>4.8 (120 reviews)</span>
    <div class="certification-card__city">New York, NY - 19.9 mi</div>
    <span>(212) 555-0134</span>
    <a href="/roofing-contractors/acme-roofing-10432">View profile</a>
  </div>
  <div class="certification-card">
    <h3>No Link Roofing</h3>
    <span>3.9</span>
  </div>
  <div class="certification-card">
    <h3>Borough Exteriors</h3>
    <span>4.5</span>
    <div class="certification-card__city">Brooklyn, NY - 4.2 mi</div>
    <a href="/roofing-contractors/borough-exteriors-20981">View profile</a>
  </div>
</body></html>
"#;

const PROFILE_PAGE: &str = r#"
<html><body>
  <div class="about-section__content">
    Family owned and operated, serving the tri-state area.
  </div>
  <span class="contractor-reviews__quote-text">Great   crew, spotless cleanup afterwards.</span>
  <span class="contractor-reviews__quote-text">Great   crew, spotless cleanup afterwards.</span>
  <span class="contractor-reviews__quote-text">Fast quote and fair pricing on a full replacement.</span>
  <div class="contractor-reviews__date">Jan 2024</div>
  <div class="contractor-reviews__date">Mar 2024</div>
  <div data-layer='[{"event_attributes":{"number_of_employees":"10-20"}}]'></div>
  <div class="contractor-details">
    In business since: 1987
    License Number HIC-0654321
  </div>
</body></html>
"#;

#[test]
fn listing_cards_skip_chrome_and_linkless_entries() {
    let cards = parse_listing_cards(LISTING_PAGE).expect("parse");
    assert_eq!(cards.len(), 2);

    assert_eq!(cards[0].name.as_deref(), Some("Acme Roofing"));
    assert_eq!(cards[0].rating.as_deref(), Some("4.8 (120 reviews)"));
    assert_eq!(cards[0].location.as_deref(), Some("New York, NY"));
    assert_eq!(cards[0].phone.as_deref(), Some("(212) 555-0134"));
    assert_eq!(
        cards[0].profile_url,
        "/roofing-contractors/acme-roofing-10432"
    );

    assert_eq!(cards[1].name.as_deref(), Some("Borough Exteriors"));
    assert_eq!(cards[1].phone, None);
}

#[test]
fn listing_card_ids_derive_from_profile_urls() {
    let cards = parse_listing_cards(LISTING_PAGE).expect("parse");
    let ids: Vec<String> = cards
        .iter()
        .map(|c| contractor_id_from_url(&c.profile_url))
        .collect();
    assert_eq!(ids, vec!["10432", "20981"]);
}

#[test]
fn detail_fields_extract_best_effort() {
    let detail = extract_detail_fields(PROFILE_PAGE);

    assert_eq!(
        detail.about.as_deref(),
        Some("Family owned and operated, serving the tri-state area.")
    );
    // Duplicate quotes collapse, whitespace normalizes, dates zip in order.
    assert_eq!(
        detail.reviews,
        vec![
            "Great crew, spotless cleanup afterwards. (Jan 2024)",
            "Fast quote and fair pricing on a full replacement. (Mar 2024)",
        ]
    );
    assert_eq!(detail.founding_year.as_deref(), Some("1987"));
    assert_eq!(detail.state_license.as_deref(), Some("hic-0654321"));
    assert_eq!(detail.number_of_employees.as_deref(), Some("10-20"));
}

#[test]
fn detail_extraction_of_sparse_page_leaves_fields_empty() {
    let detail = extract_detail_fields("<html><body><p>Nothing here.</p></body></html>");
    assert_eq!(detail.about, None);
    assert!(detail.reviews.is_empty());
    assert_eq!(detail.founding_year, None);
    assert_eq!(detail.state_license, None);
    assert_eq!(detail.number_of_employees, None);
}
