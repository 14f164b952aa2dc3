use anyhow::Result;
use gamwich_lib::auth::{codes, session};
use gamwich_lib::store::household;

#[path = "util.rs"]
mod util;

#[tokio::test]
async fn invited_member_logs_in_with_an_emailed_code() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, _admin) = util::seed_household(&pool).await?;

    // Before the invite the address does not exist and nothing leaks that.
    assert!(codes::request(&pool, "sam@shire.example").await?.is_none());

    let sam = util::add_member(&pool, hh.id, "Sam@Shire.example", "Sam").await?;
    assert_eq!(sam.email, "sam@shire.example"); // normalized on insert

    let (user, code) = codes::request(&pool, "sam@shire.example")
        .await?
        .expect("invited address gets a code");
    assert_eq!(user.id, sam.id);

    let outcome = codes::verify(&pool, "SAM@shire.example", &code).await?;
    assert_eq!(
        outcome,
        codes::VerifyOutcome::Verified {
            email: "sam@shire.example".to_string(),
            purpose: codes::PURPOSE_LOGIN.to_string(),
            household_id: None,
        }
    );

    let households = household::households_for_user(&pool, sam.id).await?;
    assert_eq!(households.len(), 1);
    let token = session::create(&pool, sam.id, households[0].id).await?;
    let ctx = session::authenticate(&pool, &token)
        .await?
        .expect("fresh session authenticates");
    assert_eq!(ctx.user_id, sam.id);
    assert_eq!(ctx.role, "member");
    assert!(!ctx.is_admin());
    Ok(())
}

#[tokio::test]
async fn invite_code_carries_the_inviting_household() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (bag_end, _frodo) = util::seed_household(&pool).await?;

    let sam = util::add_member(&pool, bag_end.id, "sam@shire.example", "Sam").await?;
    let code = codes::issue(
        &pool,
        "sam@shire.example",
        codes::PURPOSE_INVITE,
        Some(bag_end.id),
    )
    .await?;

    // The accept link consumes the code and the session lands in the
    // carried household, not in whatever membership sorts first.
    let outcome = codes::verify(&pool, "sam@shire.example", &code).await?;
    assert_eq!(
        outcome,
        codes::VerifyOutcome::Verified {
            email: "sam@shire.example".to_string(),
            purpose: codes::PURPOSE_INVITE.to_string(),
            household_id: Some(bag_end.id),
        }
    );
    household::ensure_membership(&pool, sam.id, bag_end.id, "member").await?;
    let token = session::create(&pool, sam.id, bag_end.id).await?;
    let ctx = session::authenticate(&pool, &token).await?.unwrap();
    assert_eq!(ctx.household_id, bag_end.id);
    Ok(())
}

#[tokio::test]
async fn register_code_confirms_the_new_household() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, pippin) = household::create_household_with_admin(
        &pool,
        "Great Smials",
        "pippin@shire.example",
        "Pippin",
    )
    .await?;
    let code = codes::issue(
        &pool,
        "pippin@shire.example",
        codes::PURPOSE_REGISTER,
        Some(hh.id),
    )
    .await?;

    let outcome = codes::verify(&pool, "pippin@shire.example", &code).await?;
    assert_eq!(
        outcome,
        codes::VerifyOutcome::Verified {
            email: "pippin@shire.example".to_string(),
            purpose: codes::PURPOSE_REGISTER.to_string(),
            household_id: Some(hh.id),
        }
    );
    let token = session::create(&pool, pippin.id, hh.id).await?;
    let ctx = session::authenticate(&pool, &token).await?.unwrap();
    assert!(ctx.is_admin());
    assert_eq!(ctx.household_id, hh.id);
    Ok(())
}

#[tokio::test]
async fn verify_failure_reasons_are_distinct() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (_, frodo) = util::seed_household(&pool).await?;

    // No live code yet.
    assert_eq!(
        codes::verify(&pool, &frodo.email, "123456").await?,
        codes::VerifyOutcome::Expired
    );

    let (_, code) = codes::request(&pool, &frodo.email).await?.unwrap();
    let wrong = if code == "000000" { "000001" } else { "000000" };
    for _ in 0..codes::MAX_ATTEMPTS {
        assert_eq!(
            codes::verify(&pool, &frodo.email, wrong).await?,
            codes::VerifyOutcome::IncorrectCode
        );
    }
    // The budget is spent: even the correct code now reports the lockout.
    assert_eq!(
        codes::verify(&pool, &frodo.email, &code).await?,
        codes::VerifyOutcome::TooManyAttempts
    );
    Ok(())
}

#[tokio::test]
async fn member_of_two_households_can_switch_between_them() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (bag_end, frodo) = util::seed_household(&pool).await?;
    let (crickhollow, _merry) = household::create_household_with_admin(
        &pool,
        "Crickhollow",
        "merry@shire.example",
        "Merry",
    )
    .await?;
    household::invite_member(&pool, crickhollow.id, "frodo@shire.example", "Frodo", "member")
        .await?;

    let token = session::create(&pool, frodo.id, bag_end.id).await?;
    assert!(session::authenticate(&pool, &token).await?.unwrap().is_admin());

    session::switch_household(&pool, &token, crickhollow.id).await?;
    let ctx = session::authenticate(&pool, &token).await?.unwrap();
    assert_eq!(ctx.household_id, crickhollow.id);
    assert_eq!(ctx.role, "member");

    let households = household::households_for_user(&pool, frodo.id).await?;
    assert_eq!(households.len(), 2);
    Ok(())
}

#[tokio::test]
async fn duplicate_invite_is_a_conflict() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, _) = util::seed_household(&pool).await?;
    util::add_member(&pool, hh.id, "sam@shire.example", "Sam").await?;
    let err = household::invite_member(&pool, hh.id, "sam@shire.example", "Sam", "member")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT/UNIQUE");
    Ok(())
}

#[tokio::test]
async fn logout_invalidates_only_that_session() -> Result<()> {
    let pool = util::memory_pool().await?;
    let (hh, frodo) = util::seed_household(&pool).await?;
    let kiosk = session::create(&pool, frodo.id, hh.id).await?;
    let phone = session::create(&pool, frodo.id, hh.id).await?;

    session::logout(&pool, &kiosk).await?;
    assert!(session::authenticate(&pool, &kiosk).await?.is_none());
    assert!(session::authenticate(&pool, &phone).await?.is_some());
    Ok(())
}
