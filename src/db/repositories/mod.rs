mod achievements;
mod activities;
mod feed_items;
